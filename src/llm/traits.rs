//! LLM 客户端抽象
//!
//! 服务端无状态：每次请求都带上完整的对话历史与（可选）函数目录，
//! 回复为文本、函数调用或错误三者之一。

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::functions::FunctionDeclaration;
use crate::memory::ConversationTurn;

/// 模型一轮回复
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    Text(String),
    FunctionCall { name: String, arguments: Value },
    /// 服务端返回的错误负载
    Error(String),
}

/// 请求层错误（网络、编码、鉴权等）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// functions 为 None 时不向服务声明函数（图片请求）
    async fn complete(
        &self,
        turns: &[ConversationTurn],
        functions: Option<&[FunctionDeclaration]>,
    ) -> Result<ModelReply, LlmError>;

    /// 后端名称（日志用）
    fn name(&self) -> &str;
}
