//! 函数调用路由
//!
//! 把模型发出的结构化调用校验为设备命令：查目录、按负载形态拼命令、按调用方式选择 write 或 read，
//! 并把设备结果规整为 FunctionResult；每次调用输出结构化审计日志（JSON）。只做一次传输操作，不重试。

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;
use crate::functions::catalog::VALUE_PLACEHOLDER;
use crate::functions::{DeviceFunctionSpec, FunctionCatalog, FunctionDeclaration, InvocationMode, PayloadShape};
use crate::transport::{wire, DeviceTransport};

/// 模型发出的函数调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// 统一的函数结果（作为 function 轮次内容回送模型）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResult {
    pub description: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl FunctionResult {
    pub fn failure(e: &AgentError) -> Self {
        Self {
            description: "error".to_string(),
            value: e.to_string(),
            error: true,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.value.clone())
    }
}

/// 一次分派的结果，附带是否需要回送模型
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionOutcome {
    pub result: FunctionResult,
    pub round_trip: bool,
}

/// 路由器：持有目录与传输
pub struct FunctionRouter {
    catalog: FunctionCatalog,
    transport: Arc<dyn DeviceTransport>,
    value_delimiter: String,
}

impl FunctionRouter {
    pub fn new(
        catalog: FunctionCatalog,
        transport: Arc<dyn DeviceTransport>,
        value_delimiter: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            transport,
            value_delimiter: value_delimiter.into(),
        }
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.catalog.declarations()
    }

    pub fn catalog(&self) -> &FunctionCatalog {
        &self.catalog
    }

    /// 分派并把任何错误规整为 error 结果
    pub async fn dispatch(&self, call: &FunctionCall) -> FunctionOutcome {
        match self.try_dispatch(call).await {
            Ok(outcome) => outcome,
            Err(e) => FunctionOutcome {
                result: FunctionResult::failure(&e),
                round_trip: false,
            },
        }
    }

    /// 分派；未知函数与参数错误不触碰传输
    pub async fn try_dispatch(&self, call: &FunctionCall) -> Result<FunctionOutcome, AgentError> {
        let spec = self
            .catalog
            .get(&call.name)
            .ok_or_else(|| AgentError::UnknownFunction(call.name.clone()))?;
        let payload = build_payload(spec, &call.arguments, &self.value_delimiter)?;

        let start = Instant::now();
        let result = match spec.mode {
            InvocationMode::FireAndForget => self
                .transport
                .write(&payload)
                .await
                .map(|sent| FunctionResult {
                    description: "command sent".to_string(),
                    value: sent,
                    error: false,
                }),
            InvocationMode::AwaitResponse => self
                .transport
                .read(&payload)
                .await
                .map(|reply| FunctionResult {
                    description: "device response".to_string(),
                    value: reply.value,
                    error: false,
                }),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "function_audit",
            "function": spec.name,
            "payload": payload,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit.to_string(), "function");

        Ok(FunctionOutcome {
            result: result.map_err(AgentError::from)?,
            round_trip: spec.round_trip(),
        })
    }
}

/// 从调用参数中取值：`{"value": ...}`、裸字符串 / 数字 / 布尔；缺省返回 None
fn argument_value(arguments: &Value) -> Option<String> {
    let v = match arguments {
        Value::Object(map) => map.get("value")?,
        other => other,
    };
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        _ => None,
    }
}

/// 按负载形态拼出设备命令（不含换行）
pub fn build_payload(
    spec: &DeviceFunctionSpec,
    arguments: &Value,
    delimiter: &str,
) -> Result<String, AgentError> {
    let value = argument_value(arguments).or_else(|| spec.default_value.clone());
    let missing = || AgentError::InvalidArguments(spec.name.clone(), "missing value".to_string());
    // 一次调用只能是一行命令
    if value.as_deref().is_some_and(|v| v.chars().any(char::is_control)) {
        return Err(AgentError::InvalidArguments(
            spec.name.clone(),
            "value contains control characters".to_string(),
        ));
    }

    match spec.payload {
        PayloadShape::RawString if spec.command.contains(VALUE_PLACEHOLDER) => {
            let value = value.ok_or_else(missing)?;
            Ok(spec.command.replace(VALUE_PLACEHOLDER, &value))
        }
        PayloadShape::RawString => Ok(spec.command.clone()),
        PayloadShape::NameValue => {
            let value = value.ok_or_else(missing)?;
            Ok(wire::join_name_value(&spec.command, delimiter, &value))
        }
    }
}
