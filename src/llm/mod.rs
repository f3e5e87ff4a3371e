//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::{MockLlmClient, RecordedRequest, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError, ModelReply};

use crate::config::LlmSection;
use crate::core::AgentError;

/// 根据 [llm] 段选择后端；真实后端缺少 API Key 属于不可恢复的启动错误
pub fn create_llm_from_config(llm: &LlmSection) -> Result<Arc<dyn LlmClient>, AgentError> {
    match llm.provider.to_lowercase().as_str() {
        "mock" => {
            tracing::warn!("Using Mock LLM (provider = mock)");
            Ok(Arc::new(MockLlmClient))
        }
        "openai" => {
            let api_key = std::env::var(&llm.api_key_env)
                .ok()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| {
                    AgentError::SetupFatal(format!("{} is not set", llm.api_key_env))
                })?;
            tracing::info!("Using OpenAI-compatible LLM ({})", llm.model);
            Ok(Arc::new(OpenAiClient::new(
                llm.base_url.as_deref(),
                &llm.model,
                &api_key,
            )))
        }
        other => Err(AgentError::SetupFatal(format!("unknown llm provider: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_provider() {
        let llm = LlmSection {
            provider: "mock".to_string(),
            ..LlmSection::default()
        };
        assert_eq!(create_llm_from_config(&llm).unwrap().name(), "mock");
    }

    #[test]
    fn test_missing_key_is_fatal() {
        let llm = LlmSection {
            api_key_env: "ARMLINK_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..LlmSection::default()
        };
        assert!(matches!(
            create_llm_from_config(&llm),
            Err(AgentError::SetupFatal(_))
        ));
    }

    #[test]
    fn test_unknown_provider_is_fatal() {
        let llm = LlmSection {
            provider: "carrier-pigeon".to_string(),
            ..LlmSection::default()
        };
        assert!(create_llm_from_config(&llm).is_err());
    }
}
