//! 测试替身（无需硬件）
//!
//! - MemoryPortOpener：每次打开生成一对内存管道，设备端通过 mpsc 交给测试，模拟插拔与回复
//! - RecordingTransport：记录所有写入、按脚本返回 read 结果的 DeviceTransport

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};

use crate::transport::{
    ChannelState, DeviceNotification, DeviceReply, DeviceTransport, OpenedPort, PortOpener,
    TransportError, TransportEvent,
};

/// 内存端口：打开成功时把设备端发给测试
pub struct MemoryPortOpener {
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
    devices: mpsc::UnboundedSender<SimulatedDevice>,
}

impl MemoryPortOpener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SimulatedDevice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                attempts: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(0),
                devices: tx,
            },
            rx,
        )
    }

    /// 接下来 n 次打开失败（模拟设备未插入）
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// 累计打开尝试次数
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortOpener for MemoryPortOpener {
    async fn open(&self) -> Result<OpenedPort, TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Unavailable("no matching device".to_string()));
        }

        let (host, device) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host);
        let (device_read, device_write) = tokio::io::split(device);
        let _ = self.devices.send(SimulatedDevice {
            reader: BufReader::new(device_read),
            writer: device_write,
        });

        Ok(OpenedPort {
            name: format!("mem{attempt}"),
            reader: Box::new(host_read),
            writer: Box::new(host_write),
        })
    }
}

/// 模拟设备端
pub struct SimulatedDevice {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl SimulatedDevice {
    /// 读取主机发来的一行（含换行符）
    pub async fn recv_raw(&mut self) -> Option<String> {
        let mut line = String::new();
        match self.reader.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line),
        }
    }

    /// 读取主机发来的一行（去掉换行符）
    pub async fn recv_line(&mut self) -> Option<String> {
        self.recv_raw()
            .await
            .map(|l| l.trim_end_matches('\n').to_string())
    }

    /// 设备上报一行
    pub async fn send_line(&mut self, line: &str) {
        let _ = self.writer.write_all(format!("{line}\n").as_bytes()).await;
        let _ = self.writer.flush().await;
    }

    /// 拔出设备：主机端读到 EOF
    pub fn disconnect(self) {
        drop(self);
    }
}

/// 记录型传输：不做 I/O，记录写入并按脚本回复
pub struct RecordingTransport {
    writes: Mutex<Vec<String>>,
    replies: Mutex<VecDeque<Result<DeviceReply, TransportError>>>,
    operations: AtomicUsize,
    events: broadcast::Sender<TransportEvent>,
    state: Mutex<ChannelState>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            writes: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::new()),
            operations: AtomicUsize::new(0),
            events,
            state: Mutex::new(ChannelState::Disconnected),
        }
    }

    /// 预置下一次 read 的结果
    pub fn push_reply(&self, reply: Result<DeviceReply, TransportError>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }

    /// 所有写出的命令（含 read 的请求行）
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// write + read + connect + close 的调用次数
    pub fn operations(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    /// 模拟设备主动上报
    pub fn inject_notification(&self, notification: DeviceNotification) {
        let _ = self.events.send(TransportEvent::Notification(notification));
    }

    fn record_write(&self, command: &str) {
        if let Ok(mut w) = self.writes.lock() {
            w.push(command.to_string());
        }
    }

    fn set_state(&self, state: ChannelState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceTransport for RecordingTransport {
    async fn connect(&self) -> Result<String, TransportError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        self.set_state(ChannelState::Connected);
        Ok("recording".to_string())
    }

    async fn write(&self, command: &str) -> Result<String, TransportError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        self.record_write(command);
        Ok(command.to_string())
    }

    async fn read(&self, command: &str) -> Result<DeviceReply, TransportError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        self.record_write(command);
        self.replies
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .unwrap_or(Err(TransportError::Timeout(3000)))
    }

    async fn close(&self) {
        self.operations.fetch_add(1, Ordering::SeqCst);
        self.set_state(ChannelState::Closed);
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn state(&self) -> ChannelState {
        self.state.lock().map(|s| *s).unwrap_or(ChannelState::Closed)
    }

    fn port_name(&self) -> Option<String> {
        (self.state() == ChannelState::Connected).then(|| "recording".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poisoned_recording_transport_keeps_working() {
        let transport = RecordingTransport::new();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = transport.writes.lock();
            panic!("poison");
        }));
        assert!(transport.writes.is_poisoned());

        assert_eq!(transport.write("M2231 V1").await.as_deref(), Ok("M2231 V1"));
        assert!(transport.writes().is_empty());
        assert_eq!(
            transport.read("temp:?").await,
            Err(TransportError::Timeout(3000))
        );
        assert_eq!(transport.operations(), 2);
    }
}
