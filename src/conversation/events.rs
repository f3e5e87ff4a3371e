//! 引擎过程事件：推送给控制面客户端

use serde::Serialize;
use serde_json::Value;

use crate::conversation::ExchangeReply;
use crate::functions::FunctionResult;
use crate::transport::{DeviceNotification, TransportEvent};

/// 单步过程事件（序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// 正在请求模型（第几跳）
    Thinking { hop: usize },
    /// 模型请求调用设备函数
    FunctionCall { name: String, arguments: Value },
    /// 设备函数返回
    FunctionResult { name: String, result: FunctionResult },
    /// 一次对话的最终结果
    Reply { reply: ExchangeReply },
    /// 设备主动通知（已翻译）
    Notification { notification: DeviceNotification },
    /// 设备连接状态变化
    Device { event: TransportEvent },
    /// 语音识别结果；interim 为 true 时只是中间结果
    Transcript { text: String, interim: bool },
}
