//! 错误类型
//!
//! 传输层与函数层错误以数据形式向上流动（FunctionResult / ExchangeReply::Error），
//! 只有 SetupFatal 会中止启动。

use thiserror::Error;

use crate::transport::TransportError;

/// 运行过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// 找不到设备或串口无法打开（可恢复，按间隔重连）
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// 设备在读超时内没有回复
    #[error("Transport timeout after {0} ms")]
    TransportTimeout(u64),

    /// 模型请求了目录中不存在的函数
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// 函数需要参数值但调用未提供且无默认值
    #[error("Invalid arguments for {0}: {1}")]
    InvalidArguments(String, String),

    /// 语言模型服务返回错误或请求失败
    #[error("Service error: {0}")]
    ServiceError(String),

    /// 缺少必需的凭据或配置（不可恢复）
    #[error("Setup failed: {0}")]
    SetupFatal(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl From<TransportError> for AgentError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(ms) => AgentError::TransportTimeout(ms),
            other => AgentError::TransportUnavailable(other.to_string()),
        }
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::ConfigError(e.to_string())
    }
}

impl AgentError {
    /// 是否为不可恢复错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::SetupFatal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_map_to_agent_errors() {
        assert_eq!(
            AgentError::from(TransportError::Timeout(3000)),
            AgentError::TransportTimeout(3000)
        );
        assert!(matches!(
            AgentError::from(TransportError::NotConnected),
            AgentError::TransportUnavailable(_)
        ));
    }

    #[test]
    fn test_only_setup_errors_are_fatal() {
        assert!(AgentError::SetupFatal("OPENAI_API_KEY is not set".into()).is_fatal());
        assert!(!AgentError::UnknownFunction("fly".into()).is_fatal());
    }
}
