//! 设备通知映射：把设备主动上报的 `key:value` 翻译成面向用户的描述

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::transport::DeviceReply;

/// 配置中的一条映射（[notifications.<key>]）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMapping {
    pub description: String,
    /// 展示值模板，`{value}` 替换为设备原始值；缺省时直接用原始值
    #[serde(default)]
    pub value: Option<String>,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    /// 是否同时作为 system 消息转给对话引擎
    #[serde(default)]
    pub forward: bool,
}

fn default_kind() -> String {
    "info".to_string()
}

/// 翻译后的设备通知
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceNotification {
    pub key: String,
    pub description: String,
    pub value: String,
    pub kind: String,
    pub forward: bool,
}

impl DeviceNotification {
    /// 转给模型的 system 文本
    pub fn to_system_text(&self) -> String {
        format!("Device notification ({}): {} = {}", self.kind, self.description, self.value)
    }
}

/// 不可变的映射表，随配置加载
#[derive(Debug, Clone, Default)]
pub struct NotificationTable {
    mappings: BTreeMap<String, NotificationMapping>,
}

impl NotificationTable {
    pub fn new(mappings: BTreeMap<String, NotificationMapping>) -> Self {
        Self { mappings }
    }

    pub fn translate(&self, reply: &DeviceReply) -> Option<DeviceNotification> {
        let mapping = self.mappings.get(&reply.name)?;
        let value = match &mapping.value {
            Some(template) => template.replace("{value}", &reply.value),
            None => reply.value.clone(),
        };
        Some(DeviceNotification {
            key: reply.name.clone(),
            description: mapping.description.clone(),
            value,
            kind: mapping.kind.clone(),
            forward: mapping.forward,
        })
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}
