//! 可移动介质弹出
//!
//! 配置重新加载但内容未变时（通常是用户从 U 盘更新配置后原样插回），调用弹出动作让介质可以安全拔出。

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::MediaSection;
use crate::core::AgentError;

#[async_trait]
pub trait MediaEjector: Send + Sync {
    async fn eject(&self) -> Result<(), AgentError>;
}

/// 执行外部命令弹出介质；命令为空时只记录日志
#[derive(Debug, Clone, Default)]
pub struct CommandEjector {
    command: Vec<String>,
}

impl CommandEjector {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    pub fn from_config(media: &MediaSection) -> Self {
        Self::new(media.eject_command.clone())
    }
}

#[async_trait]
impl MediaEjector for CommandEjector {
    async fn eject(&self) -> Result<(), AgentError> {
        let Some((program, args)) = self.command.split_first() else {
            tracing::info!("No eject command configured, skipping media eject");
            return Ok(());
        };
        let status = Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| AgentError::ServiceError(format!("failed to run {}: {}", program, e)))?;
        if status.success() {
            tracing::info!("Media ejected");
            Ok(())
        } else {
            Err(AgentError::ServiceError(format!("{} exited with {}", program, status)))
        }
    }
}

/// 计数型弹出器（测试用）
#[derive(Debug, Default)]
pub struct CountingEjector {
    count: AtomicUsize,
}

impl CountingEjector {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaEjector for CountingEjector {
    async fn eject(&self) -> Result<(), AgentError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
