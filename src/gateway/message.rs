//! 控制面消息协议
//!
//! 入站：`{"type": "pause" | "resume" | "setVolume" | "restart-app" | "config-status" | "reload-config" | "text" | "image", ...}`，
//! 非 JSON 文本帧按 `text` 处理。出站：引擎事件（EngineEvent）、状态与错误帧。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::ChannelState;

/// 入站控制命令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlCommand {
    #[serde(rename = "pause")]
    Pause,
    #[serde(rename = "resume")]
    Resume,
    #[serde(rename = "setVolume")]
    SetVolume { value: u8 },
    #[serde(rename = "restart-app")]
    RestartApp,
    #[serde(rename = "config-status")]
    ConfigStatus,
    #[serde(rename = "reload-config")]
    ReloadConfig,
    #[serde(rename = "text")]
    Text { text: String },
    /// data 为 data URL（data:image/...;base64,...）
    #[serde(rename = "image")]
    Image {
        data: String,
        #[serde(default)]
        prompt: Option<String>,
    },
}

impl ControlCommand {
    /// 解析一帧：合法 JSON 但不是已知命令时报错；非 JSON 视为用户文本
    pub fn parse(frame: &str) -> Result<Self, String> {
        match serde_json::from_str::<Value>(frame) {
            Ok(value @ Value::Object(_)) => {
                serde_json::from_value(value).map_err(|e| format!("invalid command: {e}"))
            }
            _ => {
                let text = frame.trim();
                if text.is_empty() {
                    Err("empty frame".to_string())
                } else {
                    Ok(ControlCommand::Text {
                        text: text.to_string(),
                    })
                }
            }
        }
    }
}

/// 出站应答（只发给发起请求的客户端）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlReply {
    ConfigStatus {
        source: String,
        port: Option<String>,
        device_state: ChannelState,
        functions: Vec<String>,
        notifications: usize,
        model: String,
    },
    Error {
        message: String,
    },
}

impl ControlReply {
    pub fn error(message: impl Into<String>) -> Self {
        ControlReply::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(ControlCommand::parse(r#"{"type":"pause"}"#), Ok(ControlCommand::Pause));
        assert_eq!(
            ControlCommand::parse(r#"{"type":"setVolume","value":40}"#),
            Ok(ControlCommand::SetVolume { value: 40 })
        );
        assert_eq!(
            ControlCommand::parse(r#"{"type":"restart-app"}"#),
            Ok(ControlCommand::RestartApp)
        );
        assert_eq!(
            ControlCommand::parse(r#"{"type":"image","data":"data:image/png;base64,AA"}"#),
            Ok(ControlCommand::Image {
                data: "data:image/png;base64,AA".to_string(),
                prompt: None
            })
        );
    }

    #[test]
    fn test_plain_frame_is_text() {
        assert_eq!(
            ControlCommand::parse("turn on the suction cup\n"),
            Ok(ControlCommand::Text {
                text: "turn on the suction cup".to_string()
            })
        );
        assert!(ControlCommand::parse("   ").is_err());
    }

    #[test]
    fn test_unknown_json_command_is_error() {
        assert!(ControlCommand::parse(r#"{"type":"self-destruct"}"#).is_err());
        assert!(ControlCommand::parse(r#"{"type":"setVolume"}"#).is_err());
    }

    #[test]
    fn test_reply_serialization() {
        let json = serde_json::to_value(ControlReply::error("boom")).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "boom");
    }
}
