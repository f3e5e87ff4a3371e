//! WebSocket 控制面服务器
//!
//! 每个连接一个读循环 + 一个写任务（mpsc 转发）；入站命令汇入同一个 mpsc 交给生命周期层处理，
//! 出站帧可广播给所有客户端或只发给某个客户端。shutdown 先通知各连接关闭，超时后强制中止。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::core::AgentError;
use crate::gateway::{ControlCommand, ControlReply};

pub type ClientId = String;

type Connections = Arc<RwLock<HashMap<ClientId, mpsc::UnboundedSender<String>>>>;

/// 来自某个客户端的命令
#[derive(Debug, Clone, PartialEq)]
pub struct InboundCommand {
    pub client_id: ClientId,
    pub command: ControlCommand,
}

pub struct ControlServer {
    local_addr: SocketAddr,
    connections: Connections,
    tasks: Arc<StdMutex<JoinSet<()>>>,
    accept_task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl ControlServer {
    /// 绑定并开始接受连接；返回服务器与入站命令接收端
    pub async fn bind(
        bind_addr: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundCommand>), AgentError> {
        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| AgentError::ConfigError(format!("Invalid bind address: {}", e)))?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| AgentError::ServiceError(format!("Failed to bind {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AgentError::ServiceError(e.to_string()))?;

        tracing::info!("Control server listening on ws://{}", local_addr);

        let (shutdown, _) = watch::channel(false);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let connections: Connections = Arc::new(RwLock::new(HashMap::new()));
        let tasks = Arc::new(StdMutex::new(JoinSet::new()));

        let accept_task = tokio::spawn(accept_loop(
            listener,
            shutdown.subscribe(),
            Arc::clone(&connections),
            Arc::clone(&tasks),
            commands_tx,
        ));

        Ok((
            Self {
                local_addr,
                connections,
                tasks,
                accept_task,
                shutdown,
            },
            commands_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// 向所有客户端广播
    pub async fn broadcast<T: Serialize>(&self, frame: &T) {
        let json = match serde_json::to_string(frame) {
            Ok(j) => j,
            Err(_) => return,
        };
        for tx in self.connections.read().await.values() {
            let _ = tx.send(json.clone());
        }
    }

    /// 发给指定客户端；客户端已断开时返回 false
    pub async fn send_to<T: Serialize>(&self, client_id: &str, frame: &T) -> bool {
        let connections = self.connections.read().await;
        match (connections.get(client_id), serde_json::to_string(frame)) {
            (Some(tx), Ok(json)) => tx.send(json).is_ok(),
            _ => false,
        }
    }

    /// 停止接受连接并关闭所有客户端；超过 timeout 仍未结束的连接被强制中止
    pub async fn shutdown(&self, timeout: Duration) {
        let _ = self.shutdown.send(true);
        self.accept_task.abort();

        let mut tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return,
        };
        let drained = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                "Control connections did not close within {}s, aborting {}",
                timeout.as_secs(),
                tasks.len()
            );
            tasks.abort_all();
        }
        self.connections.write().await.clear();
        tracing::info!("Control server on {} stopped", self.local_addr);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.abort_all();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
    connections: Connections,
    tasks: Arc<StdMutex<JoinSet<()>>>,
    commands: mpsc::UnboundedSender<InboundCommand>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let connections = Arc::clone(&connections);
                        let commands = commands.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        if let Ok(mut set) = tasks.lock() {
                            set.spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, connections, commands, shutdown_rx).await {
                                    tracing::error!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    connections: Connections,
    commands: mpsc::UnboundedSender<InboundCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), String> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| format!("WebSocket handshake failed: {}", e))?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let client_id = format!("ws_{}_{}", addr, uuid::Uuid::new_v4());

    tracing::info!("New control connection from {}", addr);
    connections.write().await.insert(client_id.clone(), tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(msg)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket receive error: {}", e);
                        break;
                    }
                    None => break,
                };
                match msg {
                    WsMessage::Text(text) => match ControlCommand::parse(&text) {
                        Ok(command) => {
                            tracing::debug!(client = %client_id, ?command, "control command");
                            let inbound = InboundCommand { client_id: client_id.clone(), command };
                            if commands.send(inbound).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let reply = ControlReply::error(e);
                            let _ = tx.send(serde_json::to_string(&reply).unwrap_or_default());
                        }
                    },
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    connections.write().await.remove(&client_id);
    drop(tx);
    let _ = writer.await;

    tracing::info!("Control connection closed: {}", addr);
    Ok(())
}
