//! 函数参数 JSON Schema 生成（schemars）
//!
//! 设备函数至多接受一个 `value` 参数；声明给模型的 parameters 由此生成。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 带值函数的参数格式（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ValueArgument {
    /// 发送给设备的值，如角度、开关状态或速度
    pub value: String,
}

/// 带 `value` 参数的 schema；required 为 false 时去掉 required 列表（有默认值）
pub fn value_parameters_schema(required: bool) -> Value {
    let schema = schema_for!(ValueArgument);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| no_parameters_schema());
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
        if !required {
            obj.insert("required".to_string(), Value::Array(Vec::new()));
        }
    }
    value
}

/// 无参数函数
pub fn no_parameters_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}
