//! 设备函数：目录、参数 Schema、调用路由

pub mod catalog;
pub mod router;
pub mod schema;

pub use catalog::{
    DeviceFunctionSpec, FunctionCatalog, FunctionDeclaration, InvocationMode, PayloadShape,
};
pub use router::{build_payload, FunctionCall, FunctionOutcome, FunctionResult, FunctionRouter};
