//! 行通道：半双工设备会话
//!
//! 持有一个已打开的端口（读半部交给后台读任务，写半部留在通道内），按到达顺序把上行行
//! 分派给唯一的未决读（PendingExchange）或翻译为设备通知；读任务遇到 EOF / 错误时标记断线、
//! 广播 Disconnected，并按固定间隔重连直到成功。端口的打开方式由 PortOpener 提供（串口 / 内存管道）。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::DeviceSection;
use crate::transport::wire;
use crate::transport::{
    ChannelState, DeviceReply, DeviceTransport, NotificationTable, TransportError, TransportEvent,
};

pub type PortReader = Box<dyn AsyncRead + Send + Unpin>;
pub type PortWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 已打开的端口
pub struct OpenedPort {
    pub name: String,
    pub reader: PortReader,
    pub writer: PortWriter,
}

/// 端口打开方式
#[async_trait]
pub trait PortOpener: Send + Sync + 'static {
    async fn open(&self) -> Result<OpenedPort, TransportError>;
}

#[async_trait]
impl<T: PortOpener> PortOpener for Arc<T> {
    async fn open(&self) -> Result<OpenedPort, TransportError> {
        (**self).open().await
    }
}

/// 通道时序参数
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub read_timeout: Duration,
    pub reconnect_interval: Duration,
}

impl ChannelSettings {
    pub fn from_device(device: &DeviceSection) -> Self {
        Self {
            read_timeout: Duration::from_millis(device.read_timeout_ms),
            reconnect_interval: Duration::from_secs(device.reconnect_interval_secs),
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::from_device(&DeviceSection::default())
    }
}

/// 唯一的未决读：下一条上行行即为它的回复
struct PendingExchange {
    id: u64,
    created_at: DateTime<Utc>,
    reply_tx: oneshot::Sender<DeviceReply>,
}

struct Shared<O> {
    opener: O,
    settings: ChannelSettings,
    notifications: NotificationTable,
    state: watch::Sender<ChannelState>,
    events: broadcast::Sender<TransportEvent>,
    port_name: StdMutex<Option<String>>,
    writer: Mutex<Option<PortWriter>>,
    pending: StdMutex<Option<PendingExchange>>,
    /// read 排队：同一时刻只有一个 写-等待回复 在进行
    exchange_lock: Mutex<()>,
    connect_lock: Mutex<()>,
    next_exchange: AtomicU64,
    /// 每次成功打开递增，旧读任务的断线通知据此忽略
    generation: AtomicU64,
    closing: AtomicBool,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    reconnect_task: StdMutex<Option<JoinHandle<()>>>,
}

/// 行通道
pub struct LineChannel<O: PortOpener> {
    shared: Arc<Shared<O>>,
}

impl<O: PortOpener> LineChannel<O> {
    pub fn new(opener: O, settings: ChannelSettings, notifications: NotificationTable) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                opener,
                settings,
                notifications,
                state,
                events,
                port_name: StdMutex::new(None),
                writer: Mutex::new(None),
                pending: StdMutex::new(None),
                exchange_lock: Mutex::new(()),
                connect_lock: Mutex::new(()),
                next_exchange: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                closing: AtomicBool::new(false),
                reader_task: StdMutex::new(None),
                reconnect_task: StdMutex::new(None),
            }),
        }
    }

    /// 当前是否有未决读
    pub fn has_pending(&self) -> bool {
        lock(&self.shared.pending).is_some()
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<O: PortOpener> Shared<O> {
    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    /// 打开端口并启动读任务；已连接时直接返回端口名
    async fn open_port(self: &Arc<Self>) -> Result<String, TransportError> {
        let _guard = self.connect_lock.lock().await;
        if let Some(name) = lock(&self.port_name).clone() {
            return Ok(name);
        }

        self.set_state(ChannelState::Connecting);
        let port = match self.opener.open().await {
            Ok(p) => p,
            Err(e) => {
                self.set_state(ChannelState::Disconnected);
                tracing::warn!(error = %e, "Device connect failed");
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.writer.lock().await = Some(port.writer);
        *lock(&self.port_name) = Some(port.name.clone());

        let shared = Arc::clone(self);
        let reader = port.reader;
        let handle = tokio::spawn(async move { shared.read_loop(reader, generation).await });
        if let Some(old) = lock(&self.reader_task).replace(handle) {
            old.abort();
        }

        self.set_state(ChannelState::Connected);
        tracing::info!(port = %port.name, "Device connected");
        let _ = self.events.send(TransportEvent::Connected {
            port: port.name.clone(),
        });
        Ok(port.name)
    }

    async fn read_loop(self: Arc<Self>, reader: PortReader, generation: u64) {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let reason = loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break "device closed the port".to_string(),
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    self.dispatch_line(&line);
                }
                Err(e) => break format!("read error: {e}"),
            }
        };
        self.handle_disconnect(generation, reason).await;
    }

    /// 上行行分派：未决读优先，其次通知映射，其余丢弃
    fn dispatch_line(&self, raw: &str) {
        let Some(reply) = wire::parse_line(raw) else {
            return;
        };

        if let Some(pending) = lock(&self.pending).take() {
            let elapsed_ms = (Utc::now() - pending.created_at).num_milliseconds();
            tracing::debug!(exchange = pending.id, elapsed_ms, name = %reply.name, "Device reply");
            let _ = pending.reply_tx.send(reply);
            return;
        }

        match self.notifications.translate(&reply) {
            Some(notification) => {
                tracing::info!(key = %notification.key, value = %notification.value, "Device notification");
                let _ = self.events.send(TransportEvent::Notification(notification));
            }
            None => {
                tracing::debug!(line = %raw.trim_end(), "Dropping unroutable device line");
            }
        }
    }

    async fn handle_disconnect(self: &Arc<Self>, generation: u64, reason: String) {
        if self.closing.load(Ordering::SeqCst)
            || self.generation.load(Ordering::SeqCst) != generation
        {
            return;
        }

        *self.writer.lock().await = None;
        *lock(&self.port_name) = None;
        // 丢弃 sender：等待中的 read 得到 NotConnected
        lock(&self.pending).take();

        self.set_state(ChannelState::Reconnecting);
        tracing::warn!(%reason, "Device disconnected");
        let _ = self.events.send(TransportEvent::Disconnected { reason });
        self.schedule_reconnect();
    }

    /// 启动重连任务（已在运行则忽略）
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        let mut slot = lock(&self.reconnect_task);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let shared = Arc::clone(self);
        *slot = Some(tokio::spawn(async move { shared.reconnect_loop().await }));
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let interval = self.settings.reconnect_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        self.set_state(ChannelState::Reconnecting);

        loop {
            ticker.tick().await;
            if self.closing.load(Ordering::SeqCst) {
                return;
            }
            tracing::info!(interval_secs = interval.as_secs(), "Attempting device reconnect");
            match self.open_port().await {
                Ok(_) => return,
                Err(_) => self.set_state(ChannelState::Reconnecting),
            }
        }
    }

    fn clear_pending(&self, id: u64) {
        let mut slot = lock(&self.pending);
        if slot.as_ref().is_some_and(|p| p.id == id) {
            slot.take();
        }
    }
}

#[async_trait]
impl<O: PortOpener> DeviceTransport for LineChannel<O> {
    async fn connect(&self) -> Result<String, TransportError> {
        self.shared.closing.store(false, Ordering::SeqCst);
        let result = self.shared.open_port().await;
        if result.is_err() {
            self.shared.schedule_reconnect();
        }
        result
    }

    async fn write(&self, command: &str) -> Result<String, TransportError> {
        let line = wire::encode_line(command);
        let mut guard = self.shared.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        tracing::debug!(command = %line.trim_end(), "Device write");
        Ok(line.trim_end_matches('\n').to_string())
    }

    async fn read(&self, command: &str) -> Result<DeviceReply, TransportError> {
        let _exchange = self.shared.exchange_lock.lock().await;

        let id = self.shared.next_exchange.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        // 先占位再写，避免设备回复过快而错过
        *lock(&self.shared.pending) = Some(PendingExchange {
            id,
            created_at: Utc::now(),
            reply_tx,
        });

        if let Err(e) = self.write(command).await {
            self.shared.clear_pending(id);
            return Err(e);
        }

        let read_timeout = self.shared.settings.read_timeout;
        match tokio::time::timeout(read_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => {
                self.shared.clear_pending(id);
                let ms = read_timeout.as_millis() as u64;
                tracing::warn!(exchange = id, timeout_ms = ms, "Device read timed out");
                Err(TransportError::Timeout(ms))
            }
        }
    }

    async fn close(&self) {
        let shared = &self.shared;
        shared.closing.store(true, Ordering::SeqCst);

        if let Some(h) = lock(&shared.reconnect_task).take() {
            h.abort();
        }
        shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(h) = lock(&shared.reader_task).take() {
            h.abort();
        }
        lock(&shared.pending).take();

        if let Some(mut writer) = shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let was_open = lock(&shared.port_name).take().is_some();

        shared.set_state(ChannelState::Closed);
        if was_open {
            tracing::info!("Device channel closed");
            let _ = shared.events.send(TransportEvent::Disconnected {
                reason: "closed".to_string(),
            });
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    fn port_name(&self) -> Option<String> {
        lock(&self.shared.port_name).clone()
    }
}

impl<O: PortOpener> Drop for LineChannel<O> {
    fn drop(&mut self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        if let Some(h) = lock(&self.shared.reconnect_task).take() {
            h.abort();
        }
        if let Some(h) = lock(&self.shared.reader_task).take() {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MemoryPortOpener;
    use crate::transport::NotificationMapping;
    use std::collections::BTreeMap;

    fn settings() -> ChannelSettings {
        ChannelSettings {
            read_timeout: Duration::from_millis(3000),
            reconnect_interval: Duration::from_secs(10),
        }
    }

    fn temp_table() -> NotificationTable {
        let mut m = BTreeMap::new();
        m.insert(
            "temp".to_string(),
            NotificationMapping {
                description: "Temperature".to_string(),
                value: None,
                kind: "sensor".to_string(),
                forward: false,
            },
        );
        NotificationTable::new(m)
    }

    #[tokio::test]
    async fn test_write_when_not_connected() {
        let (opener, _devices) = MemoryPortOpener::new();
        let channel = LineChannel::new(opener, settings(), NotificationTable::default());
        assert_eq!(channel.write("M1").await, Err(TransportError::NotConnected));
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (opener, mut devices) = MemoryPortOpener::new();
        let opener = Arc::new(opener);
        let channel = LineChannel::new(opener.clone(), settings(), NotificationTable::default());

        let first = channel.connect().await.unwrap();
        let second = channel.connect().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(opener.attempts(), 1);
        assert_eq!(channel.state(), ChannelState::Connected);
        assert!(devices.recv().await.is_some());
        channel.close().await;
    }

    #[tokio::test]
    async fn test_write_sends_newline_terminated_line() {
        let (opener, mut devices) = MemoryPortOpener::new();
        let channel = LineChannel::new(opener, settings(), NotificationTable::default());
        channel.connect().await.unwrap();
        let mut device = devices.recv().await.unwrap();

        let sent = channel.write("M2231 V1").await.unwrap();
        assert_eq!(sent, "M2231 V1");
        assert_eq!(device.recv_raw().await.unwrap(), "M2231 V1\n");
        channel.close().await;
    }

    #[tokio::test]
    async fn test_read_returns_next_line() {
        let (opener, mut devices) = MemoryPortOpener::new();
        let channel = Arc::new(LineChannel::new(opener, settings(), temp_table()));
        channel.connect().await.unwrap();
        let mut device = devices.recv().await.unwrap();

        let reader = Arc::clone(&channel);
        let task = tokio::spawn(async move { reader.read("temp?").await });

        assert_eq!(device.recv_line().await.unwrap(), "temp?");
        // 名称不匹配也作为回复消费
        device.send_line("pos:12 ").await;

        let reply = task.await.unwrap().unwrap();
        assert_eq!(reply.name, "pos");
        assert_eq!(reply.value, "12");
        assert!(!channel.has_pending());
        channel.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_clears_pending() {
        let (opener, mut devices) = MemoryPortOpener::new();
        let channel = Arc::new(LineChannel::new(opener, settings(), NotificationTable::default()));
        channel.connect().await.unwrap();
        let mut device = devices.recv().await.unwrap();

        let result = channel.read("temp?").await;
        assert_eq!(result, Err(TransportError::Timeout(3000)));
        assert!(!channel.has_pending());
        assert_eq!(device.recv_line().await.unwrap(), "temp?");

        // 之后的 read 正常工作
        let reader = Arc::clone(&channel);
        let task = tokio::spawn(async move { reader.read("temp?").await });
        assert_eq!(device.recv_line().await.unwrap(), "temp?");
        device.send_line("temp:36").await;
        assert_eq!(task.await.unwrap().unwrap().value, "36");
        channel.close().await;
    }

    #[tokio::test]
    async fn test_back_to_back_reads_do_not_cross_talk() {
        let (opener, mut devices) = MemoryPortOpener::new();
        let channel = Arc::new(LineChannel::new(opener, settings(), NotificationTable::default()));
        channel.connect().await.unwrap();
        let mut device = devices.recv().await.unwrap();

        let first = {
            let c = Arc::clone(&channel);
            tokio::spawn(async move { c.read("a?").await })
        };
        assert_eq!(device.recv_line().await.unwrap(), "a?");

        let second = {
            let c = Arc::clone(&channel);
            tokio::spawn(async move { c.read("b?").await })
        };
        // 第二个 read 排队，直到第一个完成后才写出
        tokio::task::yield_now().await;
        device.send_line("a:1").await;
        assert_eq!(device.recv_line().await.unwrap(), "b?");
        device.send_line("b:2").await;

        assert_eq!(first.await.unwrap().unwrap().value, "1");
        assert_eq!(second.await.unwrap().unwrap().value, "2");
        channel.close().await;
    }

    #[tokio::test]
    async fn test_unsolicited_line_becomes_notification() {
        let (opener, mut devices) = MemoryPortOpener::new();
        let channel = LineChannel::new(opener, settings(), temp_table());
        let mut events = channel.subscribe();
        channel.connect().await.unwrap();
        let mut device = devices.recv().await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), TransportEvent::Connected { .. }));
        device.send_line("noise:1").await;
        device.send_line("temp:37").await;

        match events.recv().await.unwrap() {
            TransportEvent::Notification(n) => {
                assert_eq!(n.key, "temp");
                assert_eq!(n.description, "Temperature");
                assert_eq!(n.value, "37");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        channel.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_at_interval_until_success() {
        let (opener, mut devices) = MemoryPortOpener::new();
        let opener = Arc::new(opener);
        let channel = LineChannel::new(opener.clone(), settings(), NotificationTable::default());
        let mut events = channel.subscribe();
        channel.connect().await.unwrap();
        let device = devices.recv().await.unwrap();
        let _ = events.recv().await;

        opener.fail_next(2);
        device.disconnect();
        assert!(matches!(events.recv().await.unwrap(), TransportEvent::Disconnected { .. }));
        assert_eq!(channel.state(), ChannelState::Reconnecting);

        // 第 1、2 次重连失败，第 3 次成功
        tokio::time::sleep(Duration::from_secs(10) + Duration::from_millis(1)).await;
        assert_eq!(opener.attempts(), 2);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(opener.attempts(), 3);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(opener.attempts(), 4);
        assert!(matches!(events.recv().await.unwrap(), TransportEvent::Connected { .. }));
        assert_eq!(channel.state(), ChannelState::Connected);

        // 成功后不再尝试
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(opener.attempts(), 4);
        channel.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_reconnect() {
        let (opener, mut devices) = MemoryPortOpener::new();
        let opener = Arc::new(opener);
        let channel = LineChannel::new(opener.clone(), settings(), NotificationTable::default());
        let mut events = channel.subscribe();
        channel.connect().await.unwrap();
        let device = devices.recv().await.unwrap();
        let _ = events.recv().await;

        device.disconnect();
        let _ = events.recv().await;
        channel.close().await;
        assert_eq!(channel.state(), ChannelState::Closed);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(opener.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_schedules_retry() {
        let (opener, _devices) = MemoryPortOpener::new();
        let opener = Arc::new(opener);
        opener.fail_next(1);
        let channel = LineChannel::new(opener.clone(), settings(), NotificationTable::default());

        assert!(matches!(channel.connect().await, Err(TransportError::Unavailable(_))));
        tokio::time::sleep(Duration::from_secs(10) + Duration::from_millis(1)).await;
        assert_eq!(opener.attempts(), 2);
        assert_eq!(channel.state(), ChannelState::Connected);
        channel.close().await;
    }
}
