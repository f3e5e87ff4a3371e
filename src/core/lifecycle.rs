//! 应用生命周期
//!
//! 持有唯一的当前资源集（配置快照、传输、对话引擎、控制面服务器、配置监视、语音前端、监听任务），
//! 负责启动、有序停止、带防重入标志的重启，以及配置变化时的处理（内容相同则弹出介质，不同则重启）。
//!
//! 监听任务从不直接调用 stop：它们向主循环发送 [`LifecycleRequest`]，避免停止流程中止自己的调用者。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::{AppConfig, ConfigSource};
use crate::conversation::{ConversationEngine, EngineEvent, EngineSettings, ExchangeReply, SubmitRequest};
use crate::core::shutdown::{ShutdownManager, ShutdownReason};
use crate::core::watcher::{ConfigWatcher, WatchEvent};
use crate::core::AgentError;
use crate::functions::{FunctionCatalog, FunctionRouter};
use crate::gateway::{ControlCommand, ControlReply, ControlServer, InboundCommand};
use crate::llm::{create_llm_from_config, LlmClient};
use crate::media::MediaEjector;
use crate::memory::ConversationHistory;
use crate::speech::{speech_from_config, SpeechCommand, SpeechControl, SpeechInput};
use crate::transport::{serial_channel, DeviceTransport, NotificationTable, TransportEvent};

/// 发给生命周期主循环的请求
#[derive(Debug, Clone)]
pub enum LifecycleRequest {
    Restart,
    Reload(Box<AppConfig>),
    Shutdown(ShutdownReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadDecision {
    /// 内容未变：弹出介质，不重启
    Unchanged,
    /// 内容变化：已触发重启
    Restarted,
}

/// 按配置构造外部协作者；测试中替换为内存实现
pub trait ResourceFactory: Send + Sync {
    fn llm(&self, config: &AppConfig) -> Result<Arc<dyn LlmClient>, AgentError>;

    fn transport(&self, config: &AppConfig) -> Result<Arc<dyn DeviceTransport>, AgentError>;

    fn speech(&self, config: &AppConfig) -> Arc<dyn SpeechControl>;
}

/// 生产环境：串口 + 配置选择的 LLM + 子进程语音前端
#[derive(Debug, Default)]
pub struct DefaultResourceFactory;

impl ResourceFactory for DefaultResourceFactory {
    fn llm(&self, config: &AppConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
        create_llm_from_config(&config.llm)
    }

    fn transport(&self, config: &AppConfig) -> Result<Arc<dyn DeviceTransport>, AgentError> {
        let notifications = NotificationTable::new(config.notifications.clone());
        Ok(Arc::new(serial_channel(&config.device, notifications)))
    }

    fn speech(&self, config: &AppConfig) -> Arc<dyn SpeechControl> {
        speech_from_config(&config.speech)
    }
}

/// 监听任务集合：drop 时全部中止（包括 start 中途被取消的情况）
#[derive(Default)]
struct ListenerTasks(Vec<JoinHandle<()>>);

impl ListenerTasks {
    fn spawn<F>(&mut self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.0.push(tokio::spawn(future));
    }
}

impl Drop for ListenerTasks {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

struct ResourceSet {
    config: AppConfig,
    transport: Arc<dyn DeviceTransport>,
    engine: Arc<ConversationEngine>,
    server: Option<Arc<ControlServer>>,
    watcher: Option<ConfigWatcher>,
    speech: Arc<dyn SpeechControl>,
    listeners: ListenerTasks,
}

impl ResourceSet {
    /// 有序释放：监听任务 -> 配置监视 -> 传输 -> 控制面 -> 语音前端
    async fn teardown(self) {
        let ResourceSet {
            config,
            transport,
            engine,
            server,
            watcher,
            speech,
            listeners,
        } = self;

        drop(listeners);
        if let Some(watcher) = watcher {
            watcher.stop();
        }
        transport.close().await;
        if let Some(server) = server {
            server
                .shutdown(Duration::from_secs(config.server.shutdown_timeout_secs))
                .await;
        }
        speech.stop().await;
        drop(engine);
        tracing::info!("Resources released");
    }
}

pub struct LifecycleManager {
    source: Arc<dyn ConfigSource>,
    factory: Arc<dyn ResourceFactory>,
    ejector: Arc<dyn MediaEjector>,
    shutdown: ShutdownManager,
    current: Mutex<Option<ResourceSet>>,
    restarting: AtomicBool,
    restart_task: StdMutex<Option<JoinHandle<()>>>,
    starts: AtomicUsize,
    requests: mpsc::UnboundedSender<LifecycleRequest>,
    inbox: StdMutex<Option<mpsc::UnboundedReceiver<LifecycleRequest>>>,
}

impl LifecycleManager {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        factory: Arc<dyn ResourceFactory>,
        ejector: Arc<dyn MediaEjector>,
        shutdown: ShutdownManager,
    ) -> Arc<Self> {
        let (requests, inbox) = mpsc::unbounded_channel();
        Arc::new(Self {
            source,
            factory,
            ejector,
            shutdown,
            current: Mutex::new(None),
            restarting: AtomicBool::new(false),
            restart_task: StdMutex::new(None),
            starts: AtomicUsize::new(0),
            requests,
            inbox: StdMutex::new(Some(inbox)),
        })
    }

    /// 请求发送端（供外部组件向主循环投递请求）
    pub fn requester(&self) -> mpsc::UnboundedSender<LifecycleRequest> {
        self.requests.clone()
    }

    /// 成功启动的次数
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting.load(Ordering::SeqCst)
    }

    pub async fn is_running(&self) -> bool {
        self.current.lock().await.is_some()
    }

    pub async fn current_config(&self) -> Option<AppConfig> {
        self.current.lock().await.as_ref().map(|s| s.config.clone())
    }

    pub async fn engine(&self) -> Option<Arc<ConversationEngine>> {
        self.current.lock().await.as_ref().map(|s| Arc::clone(&s.engine))
    }

    pub async fn transport(&self) -> Option<Arc<dyn DeviceTransport>> {
        self.current.lock().await.as_ref().map(|s| Arc::clone(&s.transport))
    }

    pub async fn control_addr(&self) -> Option<SocketAddr> {
        self.current
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.server.as_ref().map(|srv| srv.local_addr()))
    }

    /// 构建并启动完整资源集；已有资源集时先完整释放
    pub async fn start(self: &Arc<Self>) -> Result<(), AgentError> {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            tracing::info!("Releasing previous resources before start");
            previous.teardown().await;
        }

        let config = self
            .source
            .load()
            .map_err(|e| AgentError::SetupFatal(format!("cannot load config from {}: {}", self.source.describe(), e)))?;
        config.validate()?;

        let llm = self.factory.llm(&config)?;
        let transport = self.factory.transport(&config)?;
        let mut listeners = ListenerTasks::default();

        match transport.connect().await {
            Ok(port) => tracing::info!("Device connected on {}", port),
            Err(e) => tracing::warn!("Device not connected ({}), retrying in background", e),
        }

        let catalog = FunctionCatalog::new(config.functions.clone());
        let router = Arc::new(FunctionRouter::new(
            catalog,
            Arc::clone(&transport),
            config.device.value_delimiter.clone(),
        ));
        let engine = Arc::new(ConversationEngine::new(
            llm,
            router,
            ConversationHistory::from_seed(&config.conversation.seed),
            EngineSettings::from_config(&config),
        ));
        let speech = self.factory.speech(&config);

        listeners.spawn(transport_listener(transport.subscribe(), Arc::clone(&engine)));
        if let Some(inputs) = speech.take_inputs() {
            listeners.spawn(speech_listener(inputs, Arc::clone(&engine)));
        }

        let server = if config.server.enabled {
            match ControlServer::bind(&config.server.bind_addr).await {
                Ok((server, commands)) => {
                    let server = Arc::new(server);
                    let ctx = ControlContext {
                        engine: Arc::clone(&engine),
                        speech: Arc::clone(&speech),
                        server: Arc::clone(&server),
                        transport: Arc::clone(&transport),
                        requests: self.requests.clone(),
                        source: self.source.describe(),
                        model: config.llm.model.clone(),
                        notifications: config.notifications.len(),
                    };
                    listeners.spawn(command_loop(commands, ctx));
                    Some(server)
                }
                Err(e) => {
                    tracing::warn!("Control server unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        listeners.spawn(event_forwarder(
            engine.subscribe(),
            server.clone(),
            config.speech.speak_replies.then(|| Arc::clone(&speech)),
        ));

        let watcher = if config.watcher.enabled {
            let (watch_tx, watch_rx) = mpsc::channel(4);
            let watcher = ConfigWatcher::spawn(
                Arc::clone(&self.source),
                Duration::from_secs(config.watcher.poll_interval_secs),
                watch_tx,
            );
            listeners.spawn(watch_listener(watch_rx, self.requests.clone()));
            Some(watcher)
        } else {
            None
        };

        self.starts.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            "{} started ({} functions, {} notification mappings)",
            config.app.name.as_deref().unwrap_or("armlink"),
            config.functions.len(),
            config.notifications.len()
        );

        *current = Some(ResourceSet {
            config,
            transport,
            engine,
            server,
            watcher,
            speech,
            listeners,
        });
        Ok(())
    }

    /// 释放当前资源集；restart 为 true 时延迟后重新 start（重启进行中再次请求为空操作）
    pub async fn stop(self: &Arc<Self>, restart: bool) {
        if restart && self.restarting.swap(true, Ordering::SeqCst) {
            tracing::info!("Restart already in progress, ignoring");
            return;
        }
        if !restart {
            if let Some(task) = self.restart_task.lock().ok().and_then(|mut t| t.take()) {
                task.abort();
                self.restarting.store(false, Ordering::SeqCst);
            }
        }

        let previous = self.current.lock().await.take();
        let delay = previous
            .as_ref()
            .map(|s| s.config.server.restart_delay_ms)
            .unwrap_or_else(|| AppConfig::default().server.restart_delay_ms);
        if let Some(set) = previous {
            set.teardown().await;
        }

        if restart {
            tracing::info!("Restarting in {} ms", delay);
            let manager = Arc::clone(self);
            let task = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let result = manager.start().await;
                manager.restarting.store(false, Ordering::SeqCst);
                if let Err(e) = result {
                    tracing::error!("Restart failed: {}", e);
                    manager
                        .shutdown
                        .shutdown(ShutdownReason::FatalError(e.to_string()));
                }
            });
            if let Ok(mut slot) = self.restart_task.lock() {
                *slot = Some(task);
            }
        }
    }

    /// 处理配置变化：与运行中的配置完整比较
    pub async fn reload(self: &Arc<Self>, candidate: AppConfig) -> ReloadDecision {
        let unchanged = self
            .current
            .lock()
            .await
            .as_ref()
            .map(|s| s.config == candidate)
            .unwrap_or(false);

        if unchanged {
            tracing::info!("Config unchanged, ejecting media");
            if let Err(e) = self.ejector.eject().await {
                tracing::warn!("Media eject failed: {}", e);
            }
            ReloadDecision::Unchanged
        } else {
            tracing::info!("Config changed, restarting");
            self.stop(true).await;
            ReloadDecision::Restarted
        }
    }

    /// 启动并服务请求，直到收到关闭请求或系统信号；最后有序释放
    pub async fn run(self: &Arc<Self>) -> Result<(), AgentError> {
        let mut inbox = self
            .inbox
            .lock()
            .ok()
            .and_then(|mut i| i.take())
            .ok_or_else(|| AgentError::SetupFatal("lifecycle loop already running".to_string()))?;

        self.start().await?;
        let token = self.shutdown.token();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                request = inbox.recv() => match request {
                    Some(LifecycleRequest::Restart) => self.stop(true).await,
                    Some(LifecycleRequest::Reload(candidate)) => {
                        let decision = self.reload(*candidate).await;
                        tracing::debug!(?decision, "Reload handled");
                    }
                    Some(LifecycleRequest::Shutdown(reason)) => self.shutdown.shutdown(reason),
                    None => break,
                }
            }
        }

        tracing::info!("Shutting down: {:?}", self.shutdown.reason());
        self.stop(false).await;
        match self.shutdown.reason() {
            Some(ShutdownReason::FatalError(message)) => Err(AgentError::SetupFatal(message)),
            _ => Ok(()),
        }
    }
}

/// 传输事件 -> 引擎事件；forward 的通知以 system 轮次转给模型
async fn transport_listener(
    mut events: tokio::sync::broadcast::Receiver<TransportEvent>,
    engine: Arc<ConversationEngine>,
) {
    let mut relays = JoinSet::new();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(TransportEvent::Notification(notification)) => {
                    tracing::info!(key = %notification.key, value = %notification.value, "Device notification");
                    engine.publish(EngineEvent::Notification {
                        notification: notification.clone(),
                    });
                    if notification.forward {
                        let engine = Arc::clone(&engine);
                        relays.spawn(async move {
                            engine.relay_notification(&notification).await;
                        });
                    }
                }
                Ok(event) => engine.publish(EngineEvent::Device { event }),
                Err(RecvError::Lagged(n)) => tracing::warn!("Dropped {} transport events", n),
                Err(RecvError::Closed) => break,
            },
            Some(_) = relays.join_next(), if !relays.is_empty() => {}
        }
    }
}

/// 识别结果 -> 对话；中间结果只广播
async fn speech_listener(
    mut inputs: mpsc::UnboundedReceiver<SpeechInput>,
    engine: Arc<ConversationEngine>,
) {
    let mut exchanges = JoinSet::new();
    loop {
        tokio::select! {
            input = inputs.recv() => match input {
                Some(SpeechInput::Confirmed(text)) => {
                    tracing::info!("Heard: {}", text);
                    engine.publish(EngineEvent::Transcript {
                        text: text.clone(),
                        interim: false,
                    });
                    let engine = Arc::clone(&engine);
                    exchanges.spawn(async move {
                        engine.submit(SubmitRequest::user_text(text)).await;
                    });
                }
                Some(SpeechInput::Interim(text)) => {
                    engine.publish(EngineEvent::Transcript { text, interim: true });
                }
                None => break,
            },
            Some(_) = exchanges.join_next(), if !exchanges.is_empty() => {}
        }
    }
    // 识别进程退出后等待已提交的对话完成
    while exchanges.join_next().await.is_some() {}
}

/// 引擎事件 -> 控制面广播；文本回复交给语音前端朗读
async fn event_forwarder(
    mut events: tokio::sync::broadcast::Receiver<EngineEvent>,
    server: Option<Arc<ControlServer>>,
    speech: Option<Arc<dyn SpeechControl>>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                tracing::warn!("Dropped {} engine events", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if let Some(server) = &server {
            server.broadcast(&event).await;
        }
        if let (Some(speech), EngineEvent::Reply { reply: ExchangeReply::Text { text } }) = (&speech, &event) {
            if let Err(e) = speech.send(SpeechCommand::Speak(text.clone())).await {
                tracing::warn!("Failed to speak reply: {}", e);
            }
        }
    }
}

async fn watch_listener(
    mut events: mpsc::Receiver<WatchEvent>,
    requests: mpsc::UnboundedSender<LifecycleRequest>,
) {
    while let Some(event) = events.recv().await {
        match event {
            WatchEvent::Detected(config) => {
                if requests.send(LifecycleRequest::Reload(config)).is_err() {
                    break;
                }
            }
            WatchEvent::Failed(e) => tracing::warn!("Ignoring unreadable config: {}", e),
        }
    }
}

struct ControlContext {
    engine: Arc<ConversationEngine>,
    speech: Arc<dyn SpeechControl>,
    server: Arc<ControlServer>,
    transport: Arc<dyn DeviceTransport>,
    requests: mpsc::UnboundedSender<LifecycleRequest>,
    source: String,
    model: String,
    notifications: usize,
}

impl ControlContext {
    async fn handle(&self, inbound: InboundCommand, exchanges: &mut JoinSet<()>) {
        let InboundCommand { client_id, command } = inbound;
        let speech_command = match command {
            ControlCommand::Pause => Some(SpeechCommand::Pause),
            ControlCommand::Resume => Some(SpeechCommand::Resume),
            ControlCommand::SetVolume { value } => Some(SpeechCommand::SetVolume(value)),
            ControlCommand::RestartApp | ControlCommand::ReloadConfig => {
                tracing::info!("Restart requested by {}", client_id);
                let _ = self.requests.send(LifecycleRequest::Restart);
                None
            }
            ControlCommand::ConfigStatus => {
                let catalog = self.engine.router().catalog();
                let status = ControlReply::ConfigStatus {
                    source: self.source.clone(),
                    port: self.transport.port_name(),
                    device_state: self.transport.state(),
                    functions: catalog.names(),
                    notifications: self.notifications,
                    model: self.model.clone(),
                };
                self.server.send_to(&client_id, &status).await;
                None
            }
            ControlCommand::Text { text } => {
                let engine = Arc::clone(&self.engine);
                exchanges.spawn(async move {
                    engine.submit_text(text).await;
                });
                None
            }
            ControlCommand::Image { data, prompt } => {
                let engine = Arc::clone(&self.engine);
                exchanges.spawn(async move {
                    engine.submit(SubmitRequest::image(data, prompt)).await;
                });
                None
            }
        };

        if let Some(cmd) = speech_command {
            if let Err(e) = self.speech.send(cmd).await {
                self.server
                    .send_to(&client_id, &ControlReply::error(e.to_string()))
                    .await;
            }
        }
    }
}

async fn command_loop(mut commands: mpsc::UnboundedReceiver<InboundCommand>, ctx: ControlContext) {
    let mut exchanges = JoinSet::new();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => ctx.handle(command, &mut exchanges).await,
                None => break,
            },
            Some(_) = exchanges.join_next(), if !exchanges.is_empty() => {}
        }
    }
}
