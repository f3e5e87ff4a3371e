//! 控制面网关：WebSocket 服务器与消息协议
//!
//! 入站命令（暂停/恢复语音、音量、重启、配置状态、重新加载、文本、图片）汇总交给生命周期层；
//! 出站为引擎过程事件与对单个客户端的应答。

mod message;
mod server;

pub use message::{ControlCommand, ControlReply};
pub use server::{ClientId, ControlServer, InboundCommand};
