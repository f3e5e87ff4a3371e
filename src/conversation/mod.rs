//! 对话层：对话引擎与过程事件

pub mod engine;
pub mod events;

pub use engine::{ConversationEngine, EngineSettings, ExchangeReply, SubmitRequest};
pub use events::EngineEvent;
