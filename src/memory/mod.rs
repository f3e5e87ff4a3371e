//! 记忆层：对话历史（仅内存）

pub mod conversation;

pub use conversation::{ConversationHistory, ConversationTurn, Role, TurnContent};
