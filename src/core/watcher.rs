//! 配置监视：周期比较配置来源的指纹，变化时重新加载并上报
//!
//! 只负责“发现”，是否重启由生命周期层根据内容比较决定。

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ConfigSource};

/// 监视结果
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// 指纹变化且加载成功（内容可能与当前相同）
    Detected(Box<AppConfig>),
    /// 指纹变化但加载失败
    Failed(String),
}

pub struct ConfigWatcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ConfigWatcher {
    pub fn spawn(
        source: Arc<dyn ConfigSource>,
        poll_interval: Duration,
        events: mpsc::Sender<WatchEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        // 基线指纹在启动时取，避免与随后的修改竞争
        let baseline = source.fingerprint();
        let handle = tokio::spawn(watch_loop(
            source,
            baseline,
            poll_interval,
            events,
            cancel.clone(),
        ));
        Self { cancel, handle }
    }

    /// 停止轮询（幂等）
    pub fn stop(&self) {
        self.cancel.cancel();
        self.handle.abort();
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn watch_loop(
    source: Arc<dyn ConfigSource>,
    mut last: Option<SystemTime>,
    poll_interval: Duration,
    events: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
) {
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + poll_interval, poll_interval);
    tracing::debug!("Watching config at {}", source.describe());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let current = source.fingerprint();
        if current == last {
            continue;
        }
        last = current;
        if current.is_none() {
            tracing::info!("Config source {} is gone", source.describe());
            continue;
        }

        let event = match source.load() {
            Ok(cfg) => WatchEvent::Detected(Box::new(cfg)),
            Err(e) => {
                tracing::warn!("Config changed but failed to load: {}", e);
                WatchEvent::Failed(e.to_string())
            }
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
}
