//! Armlink 入口：初始化日志、加载配置来源，运行生命周期主循环直到收到关闭信号。
//!
//! 用法：`armlink [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use armlink::config::{ConfigSource, FileConfigSource};
use armlink::core::{DefaultResourceFactory, LifecycleManager, ShutdownManager};
use armlink::media::CommandEjector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    armlink::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let source = Arc::new(FileConfigSource::new(config_path));

    // 介质弹出命令取自启动时的配置；读取失败时由生命周期给出致命错误
    let ejector = match source.load() {
        Ok(cfg) => CommandEjector::from_config(&cfg.media),
        Err(_) => CommandEjector::default(),
    };

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let manager = LifecycleManager::new(
        source,
        Arc::new(DefaultResourceFactory),
        Arc::new(ejector),
        shutdown,
    );
    manager.run().await.context("armlink stopped with a fatal error")?;

    tracing::info!("Bye");
    Ok(())
}
