//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! - MockLlmClient：回显最后一条用户文本
//! - ScriptedLlmClient：按脚本依次返回回复，并记录每次请求（轮次快照、是否声明了函数）

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::functions::FunctionDeclaration;
use crate::llm::{LlmClient, LlmError, ModelReply};
use crate::memory::{ConversationTurn, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        turns: &[ConversationTurn],
        _functions: Option<&[FunctionDeclaration]>,
    ) -> Result<ModelReply, LlmError> {
        let last_user = turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .and_then(|t| t.content.as_text())
            .unwrap_or("(no input)");
        Ok(ModelReply::Text(format!("Echo from Mock: {}", last_user)))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// 一次被记录的请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub turns: Vec<ConversationTurn>,
    pub functions: Option<Vec<FunctionDeclaration>>,
}

/// 脚本客户端：脚本用尽后返回 Error
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<ModelReply, LlmError>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    delay: Option<Duration>,
}

impl ScriptedLlmClient {
    pub fn new(replies: Vec<ModelReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    /// 每次回复前等待，用于超时与串行化测试
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, reply: Result<ModelReply, LlmError>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(
        &self,
        turns: &[ConversationTurn],
        functions: Option<&[FunctionDeclaration]>,
    ) -> Result<ModelReply, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(RecordedRequest {
                turns: turns.to_vec(),
                functions: functions.map(|f| f.to_vec()),
            });
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.replies
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .unwrap_or_else(|| Ok(ModelReply::Error("script exhausted".to_string())))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exhausted_script_returns_error() {
        let llm = ScriptedLlmClient::new(vec![ModelReply::Text("hi".into())]);
        let turns = vec![ConversationTurn::user("hello")];
        assert_eq!(
            llm.complete(&turns, None).await,
            Ok(ModelReply::Text("hi".into()))
        );
        assert_eq!(
            llm.complete(&turns, None).await,
            Ok(ModelReply::Error("script exhausted".into()))
        );
        assert_eq!(llm.request_count(), 2);
        assert!(llm.requests()[0].functions.is_none());
    }
}
