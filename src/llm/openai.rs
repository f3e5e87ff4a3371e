//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。请求与响应用 JSON 自行组装（byot），
//! 以便发送 role = function 的轮次与 functions 声明，并在用户轮次中携带图片（image_url）。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::Client;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::functions::FunctionDeclaration;
use crate::llm::{LlmClient, LlmError, ModelReply};
use crate::memory::{ConversationTurn, Role, TurnContent};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str) -> Self {
        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: TokenUsage::default(),
        }
    }
}

/// 单个轮次转为 API 消息
fn to_api_message(turn: &ConversationTurn) -> Value {
    let role = match turn.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Function => "function",
    };
    let content = match &turn.content {
        TurnContent::Text { text } => Value::String(text.clone()),
        TurnContent::Image { data_url, prompt } => {
            let mut parts = Vec::new();
            if let Some(p) = prompt {
                parts.push(json!({"type": "text", "text": p}));
            }
            parts.push(json!({"type": "image_url", "image_url": {"url": data_url}}));
            Value::Array(parts)
        }
    };

    let mut message = json!({"role": role, "content": content});
    if let Some(name) = &turn.name {
        message["name"] = Value::String(name.clone());
    }
    message
}

/// 组装 chat completion 请求体；functions 为空时不声明
pub fn build_request(
    model: &str,
    turns: &[ConversationTurn],
    functions: Option<&[FunctionDeclaration]>,
) -> Value {
    let messages: Vec<Value> = turns.iter().map(to_api_message).collect();
    let mut request = json!({"model": model, "messages": messages});
    if let Some(functions) = functions.filter(|f| !f.is_empty()) {
        request["functions"] = serde_json::to_value(functions).unwrap_or(Value::Array(Vec::new()));
    }
    request
}

/// 解析响应：error 负载 / function_call / tool_calls / 文本
pub fn parse_completion(response: &Value) -> Result<ModelReply, LlmError> {
    if let Some(err) = response.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| err.to_string());
        return Ok(ModelReply::Error(message));
    }

    let message = response
        .pointer("/choices/0/message")
        .ok_or_else(|| LlmError::Decode("response has no choices".to_string()))?;

    let call = message
        .get("function_call")
        .or_else(|| message.pointer("/tool_calls/0/function"));
    if let Some(call) = call {
        let name = call
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| LlmError::Decode("function call without name".to_string()))?;
        let arguments = match call.get("arguments") {
            Some(Value::String(raw)) if raw.trim().is_empty() => Value::Null,
            Some(Value::String(raw)) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
            }
            Some(other) => other.clone(),
            None => Value::Null,
        };
        return Ok(ModelReply::FunctionCall {
            name: name.to_string(),
            arguments,
        });
    }

    match message.get("content").and_then(Value::as_str) {
        Some(text) => Ok(ModelReply::Text(text.to_string())),
        None => Ok(ModelReply::Error("empty response from model".to_string())),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        turns: &[ConversationTurn],
        functions: Option<&[FunctionDeclaration]>,
    ) -> Result<ModelReply, LlmError> {
        let request = build_request(&self.model, turns, functions);

        let response: Value = self
            .client
            .chat()
            .create_byot(request)
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        if let Some(usage) = response.get("usage") {
            let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
            let completion = usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            self.usage.add(prompt, completion);
            let (total_prompt, total_completion) = self.usage.get();
            tracing::debug!(
                prompt,
                completion,
                total_prompt,
                total_completion,
                "Token usage"
            );
        }

        parse_completion(&response)
    }

    fn name(&self) -> &str {
        &self.model
    }
}
