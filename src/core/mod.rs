//! 核心层：错误类型、应用生命周期、配置监视与进程关闭信号

pub mod error;
pub mod lifecycle;
pub mod shutdown;
pub mod watcher;

pub use error::AgentError;
pub use lifecycle::{
    DefaultResourceFactory, LifecycleManager, LifecycleRequest, ReloadDecision, ResourceFactory,
};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use watcher::{ConfigWatcher, WatchEvent};
