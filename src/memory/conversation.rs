//! 对话历史
//!
//! 追加式的轮次序列，每次请求模型时完整回放（服务端无状态）；只存在内存中，重启后从配置种子重建。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SeedTurn;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Function,
}

/// 轮次内容：文本或图片（data URL）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnContent {
    Text { text: String },
    Image { data_url: String, prompt: Option<String> },
}

impl TurnContent {
    pub fn text(text: impl Into<String>) -> Self {
        TurnContent::Text { text: text.into() }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, TurnContent::Image { .. })
    }

    /// 文本内容；图片返回 None
    pub fn as_text(&self) -> Option<&str> {
        match self {
            TurnContent::Text { text } => Some(text),
            TurnContent::Image { .. } => None,
        }
    }
}

/// 单个轮次
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    /// role = function 时的函数名
    pub name: Option<String>,
    pub content: TurnContent,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: Role, name: Option<String>, content: TurnContent) -> Self {
        Self {
            role,
            name,
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, None, TurnContent::text(text))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, None, TurnContent::text(text))
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, None, TurnContent::text(text))
    }

    pub fn function(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Role::Function, Some(name.into()), TurnContent::text(text))
    }
}

/// 对话历史：种子 + 追加的轮次
#[derive(Clone, Debug, Default)]
pub struct ConversationHistory {
    seed: Vec<ConversationTurn>,
    turns: Vec<ConversationTurn>,
}

impl ConversationHistory {
    pub fn new(seed: Vec<ConversationTurn>) -> Self {
        Self {
            turns: seed.clone(),
            seed,
        }
    }

    pub fn from_seed(seed: &[SeedTurn]) -> Self {
        Self::new(
            seed.iter()
                .map(|s| ConversationTurn::new(s.role, None, TurnContent::text(s.content.clone())))
                .collect(),
        )
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    /// 回到种子状态
    pub fn reset(&mut self) {
        self.turns = self.seed.clone();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
