//! 设备传输抽象
//!
//! 串口与测试用替身都实现 DeviceTransport：connect / write / read / close，
//! 以及通过 broadcast 订阅连接事件与设备主动通知。路由器与对话引擎只依赖此 trait。

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::transport::DeviceNotification;

/// 传输层错误；作为数据返回，从不 panic
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("no device available: {0}")]
    Unavailable(String),

    #[error("no reply within {0} ms")]
    Timeout(u64),

    #[error("port is not open")]
    NotConnected,

    #[error("io error: {0}")]
    Io(String),
}

/// 设备回复的一行：`name:value`；无冒号时 name 为空，整行作为 value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceReply {
    pub name: String,
    pub value: String,
}

/// 通道状态机：Disconnected → Connecting → Connected → Reconnecting → Connecting …
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// 显式 close 之后
    Closed,
}

/// 通道向持有者广播的事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    Connected { port: String },
    Disconnected { reason: String },
    Notification(DeviceNotification),
}

#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// 打开设备；已连接时直接返回端口名
    async fn connect(&self) -> Result<String, TransportError>;

    /// 发送一行命令，不等待回复；返回实际发送的负载
    async fn write(&self, command: &str) -> Result<String, TransportError>;

    /// 发送命令并等待下一行回复（同一时刻只有一个未决读）
    async fn read(&self, command: &str) -> Result<DeviceReply, TransportError>;

    /// 关闭通道并取消所有定时任务（重连、未决读）
    async fn close(&self);

    /// 订阅连接事件与设备通知
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    fn state(&self) -> ChannelState;

    /// 当前打开的端口名（未连接时为 None）
    fn port_name(&self) -> Option<String> {
        None
    }
}
