//! 设备函数目录
//!
//! 每个 DeviceFunctionSpec 描述一条设备命令：调用方式（只写 / 写后等回复）、负载形态（原始字符串 / name-value）、
//! 命令模板与默认值，以及结果是否回送给模型。目录按名称索引，并生成向模型声明的函数列表。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::functions::schema::{no_parameters_schema, value_parameters_schema};

/// 调用方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationMode {
    /// 只写，不等待设备回复
    FireAndForget,
    /// 写后等待下一行回复
    AwaitResponse,
}

/// 负载形态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadShape {
    /// command 原样发送，`{value}` 占位符替换为参数值
    RawString,
    /// `<command><delimiter><value>`
    NameValue,
}

/// 值占位符
pub const VALUE_PLACEHOLDER: &str = "{value}";

/// 一条设备函数（[[functions]]）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFunctionSpec {
    pub name: String,
    /// 向模型说明用途
    pub description: String,
    pub mode: InvocationMode,
    pub payload: PayloadShape,
    /// 原始命令模板，或 name-value 形态下的设备端名称
    pub command: String,
    #[serde(default)]
    pub default_value: Option<String>,
    /// 结果是否回送给模型再生成一轮；缺省时 await-response 为 true，fire-and-forget 为 false
    #[serde(default)]
    pub round_trip: Option<bool>,
}

impl DeviceFunctionSpec {
    pub fn round_trip(&self) -> bool {
        self.round_trip
            .unwrap_or(self.mode == InvocationMode::AwaitResponse)
    }

    /// 是否需要参数值
    pub fn takes_value(&self) -> bool {
        match self.payload {
            PayloadShape::NameValue => true,
            PayloadShape::RawString => self.command.contains(VALUE_PLACEHOLDER),
        }
    }

    pub fn declaration(&self) -> FunctionDeclaration {
        let parameters = if self.takes_value() {
            value_parameters_schema(self.default_value.is_none())
        } else {
            no_parameters_schema()
        };
        FunctionDeclaration {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters,
        }
    }
}

/// 向模型声明的函数
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 函数目录：按名称存储，保留配置中的声明顺序
#[derive(Debug, Clone, Default)]
pub struct FunctionCatalog {
    specs: Vec<DeviceFunctionSpec>,
    index: HashMap<String, usize>,
}

impl FunctionCatalog {
    /// 同名条目以最后一个为准（配置校验已拒绝重名）
    pub fn new(specs: Vec<DeviceFunctionSpec>) -> Self {
        let index = specs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        Self { specs, index }
    }

    pub fn get(&self, name: &str) -> Option<&DeviceFunctionSpec> {
        self.index.get(name).map(|&i| &self.specs[i])
    }

    pub fn names(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.name.clone()).collect()
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.specs.iter().map(DeviceFunctionSpec::declaration).collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, mode: InvocationMode, payload: PayloadShape, command: &str) -> DeviceFunctionSpec {
        DeviceFunctionSpec {
            name: name.to_string(),
            description: format!("{name} description"),
            mode,
            payload,
            command: command.to_string(),
            default_value: None,
            round_trip: None,
        }
    }

    #[test]
    fn test_round_trip_defaults_follow_mode() {
        let w = spec("start_suction", InvocationMode::FireAndForget, PayloadShape::RawString, "M2231 V1");
        let r = spec("read_temp", InvocationMode::AwaitResponse, PayloadShape::NameValue, "temp");
        assert!(!w.round_trip());
        assert!(r.round_trip());

        let explicit = DeviceFunctionSpec {
            round_trip: Some(false),
            ..r
        };
        assert!(!explicit.round_trip());
    }

    #[test]
    fn test_declarations_keep_order() {
        let catalog = FunctionCatalog::new(vec![
            spec("b", InvocationMode::FireAndForget, PayloadShape::RawString, "B"),
            spec("a", InvocationMode::AwaitResponse, PayloadShape::NameValue, "a"),
        ]);
        let decls = catalog.declarations();
        assert_eq!(decls[0].name, "b");
        assert_eq!(decls[1].name, "a");
        assert!(catalog.get("a").is_some());
        assert!(catalog.get("c").is_none());
    }

    #[test]
    fn test_declaration_parameters() {
        let plain = spec("home", InvocationMode::FireAndForget, PayloadShape::RawString, "G28");
        assert!(!plain.takes_value());
        let props = &plain.declaration().parameters["properties"];
        assert!(props.as_object().map(|o| o.is_empty()).unwrap_or(true));

        let templated = spec("move_x", InvocationMode::FireAndForget, PayloadShape::RawString, "G0 X{value}");
        assert!(templated.takes_value());
        let params = templated.declaration().parameters;
        assert!(params["properties"]["value"].is_object());
        assert_eq!(params["required"][0], "value");
    }
}
