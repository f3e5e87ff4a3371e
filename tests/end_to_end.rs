//! 端到端测试：内存串口 + 脚本模型，覆盖 函数调用 -> 设备命令、读回送、设备通知、控制面与生命周期

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use armlink::config::{AppConfig, MemoryConfigSource};
use armlink::conversation::{ConversationEngine, EngineSettings, ExchangeReply};
use armlink::core::{AgentError, LifecycleManager, ResourceFactory, ShutdownManager};
use armlink::functions::{
    DeviceFunctionSpec, FunctionCall, FunctionCatalog, FunctionRouter, InvocationMode, PayloadShape,
};
use armlink::llm::{LlmClient, ModelReply, ScriptedLlmClient};
use armlink::media::CountingEjector;
use armlink::memory::{ConversationHistory, ConversationTurn, Role};
use armlink::speech::{RecordingSpeech, SpeechCommand, SpeechControl};
use armlink::transport::{
    ChannelSettings, DeviceTransport, LineChannel, MemoryPortOpener, NotificationMapping,
    NotificationTable, SimulatedDevice, TransportEvent,
};
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

fn specs() -> Vec<DeviceFunctionSpec> {
    vec![
        DeviceFunctionSpec {
            name: "start_suction".to_string(),
            description: "Turn the suction cup on".to_string(),
            mode: InvocationMode::FireAndForget,
            payload: PayloadShape::RawString,
            command: "M2231 V1".to_string(),
            default_value: None,
            round_trip: None,
        },
        DeviceFunctionSpec {
            name: "read_temp".to_string(),
            description: "Read the temperature sensor".to_string(),
            mode: InvocationMode::AwaitResponse,
            payload: PayloadShape::NameValue,
            command: "temp".to_string(),
            default_value: Some("?".to_string()),
            round_trip: None,
        },
    ]
}

fn mappings() -> BTreeMap<String, NotificationMapping> {
    let mut m = BTreeMap::new();
    m.insert(
        "temp".to_string(),
        NotificationMapping {
            description: "Temperature".to_string(),
            value: Some("{value} °C".to_string()),
            kind: "sensor".to_string(),
            forward: false,
        },
    );
    m
}

type MemoryChannel = LineChannel<Arc<MemoryPortOpener>>;

async fn connected_channel() -> (Arc<MemoryChannel>, SimulatedDevice) {
    let (opener, mut devices) = MemoryPortOpener::new();
    let channel = Arc::new(LineChannel::new(
        Arc::new(opener),
        ChannelSettings::default(),
        NotificationTable::new(mappings()),
    ));
    channel.connect().await.unwrap();
    let device = devices.recv().await.unwrap();
    (channel, device)
}

fn engine_over(channel: Arc<MemoryChannel>, llm: Arc<ScriptedLlmClient>) -> ConversationEngine {
    let router = Arc::new(FunctionRouter::new(FunctionCatalog::new(specs()), channel, ":"));
    ConversationEngine::new(
        llm,
        router,
        ConversationHistory::new(vec![ConversationTurn::system("You control a robot arm.")]),
        EngineSettings::default(),
    )
}

#[tokio::test]
async fn test_start_suction_sends_single_device_line() {
    let (channel, mut device) = connected_channel().await;
    let llm = Arc::new(ScriptedLlmClient::new(vec![ModelReply::FunctionCall {
        name: "start_suction".to_string(),
        arguments: json!({}),
    }]));
    let engine = engine_over(channel, llm.clone());

    let reply = engine.submit_text("turn on the suction cup").await;
    match reply {
        ExchangeReply::FunctionResult { name, result } => {
            assert_eq!(name, "start_suction");
            assert!(!result.error);
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    assert_eq!(device.recv_raw().await.as_deref(), Some("M2231 V1\n"));
    assert_eq!(llm.request_count(), 1);
}

#[tokio::test]
async fn test_read_round_trip_through_device() {
    let (channel, mut device) = connected_channel().await;
    let llm = Arc::new(ScriptedLlmClient::new(vec![
        ModelReply::FunctionCall {
            name: "read_temp".to_string(),
            arguments: Value::Null,
        },
        ModelReply::Text("It is 37 degrees.".to_string()),
    ]));
    let engine = Arc::new(engine_over(channel, llm.clone()));

    let exchange = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.submit_text("how warm is it?").await })
    };

    assert_eq!(device.recv_line().await.as_deref(), Some("temp:?"));
    device.send_line("temp:37").await;

    let reply = exchange.await.unwrap();
    assert_eq!(
        reply,
        ExchangeReply::Text {
            text: "It is 37 degrees.".to_string()
        }
    );

    let requests = llm.requests();
    assert_eq!(requests.len(), 2);
    let fed_back = requests[1].turns.last().unwrap();
    assert_eq!(fed_back.role, Role::Function);
    assert!(fed_back.content.as_text().unwrap().contains("37"));
}

#[tokio::test]
async fn test_unsolicited_temperature_is_translated() {
    let (channel, mut device) = connected_channel().await;
    let mut events = channel.subscribe();

    device.send_line("temp:37").await;

    let notification = loop {
        match events.recv().await.unwrap() {
            TransportEvent::Notification(n) => break n,
            _ => continue,
        }
    };
    assert_eq!(notification.key, "temp");
    assert_eq!(notification.description, "Temperature");
    assert_eq!(notification.value, "37 °C");
    assert!(!channel.has_pending());
}

#[tokio::test]
async fn test_multi_line_argument_never_reaches_device() {
    let (channel, mut device) = connected_channel().await;
    let router = FunctionRouter::new(
        FunctionCatalog::new(vec![DeviceFunctionSpec {
            name: "move_x".to_string(),
            description: "Move along X".to_string(),
            mode: InvocationMode::FireAndForget,
            payload: PayloadShape::RawString,
            command: "G0 X{value}".to_string(),
            default_value: None,
            round_trip: None,
        }]),
        channel,
        ":",
    );

    let outcome = router
        .dispatch(&FunctionCall {
            name: "move_x".to_string(),
            arguments: json!({"value": "10\nM2231 V1"}),
        })
        .await;
    assert!(outcome.result.error);

    let line = tokio::time::timeout(Duration::from_millis(200), device.recv_raw()).await;
    assert!(line.is_err(), "device received {:?}", line);
}

struct MemoryFactory {
    opener: Arc<MemoryPortOpener>,
    llm: Arc<ScriptedLlmClient>,
    speech: Arc<RecordingSpeech>,
}

impl ResourceFactory for MemoryFactory {
    fn llm(&self, _config: &AppConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
        Ok(self.llm.clone())
    }

    fn transport(&self, config: &AppConfig) -> Result<Arc<dyn DeviceTransport>, AgentError> {
        Ok(Arc::new(LineChannel::new(
            Arc::clone(&self.opener),
            ChannelSettings::from_device(&config.device),
            NotificationTable::new(config.notifications.clone()),
        )))
    }

    fn speech(&self, _config: &AppConfig) -> Arc<dyn SpeechControl> {
        self.speech.clone()
    }
}

async fn next_frame_containing<S>(client: &mut S, needle: &str) -> Value
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    loop {
        match tokio::time::timeout(Duration::from_secs(5), client.next()).await {
            Ok(Some(Ok(WsMessage::Text(text)))) if text.contains(needle) => {
                return serde_json::from_str(&text).unwrap();
            }
            Ok(Some(Ok(_))) => continue,
            other => panic!("no frame containing {}: {:?}", needle, other),
        }
    }
}

#[tokio::test]
async fn test_control_plane_drives_device_through_lifecycle() {
    let mut config = AppConfig::default();
    config.llm.provider = "mock".to_string();
    config.server.bind_addr = "127.0.0.1:0".to_string();
    config.watcher.enabled = false;
    config.functions = specs();
    config.notifications = mappings();

    let (opener, mut devices) = MemoryPortOpener::new();
    let llm = Arc::new(ScriptedLlmClient::new(vec![ModelReply::FunctionCall {
        name: "start_suction".to_string(),
        arguments: json!({}),
    }]));
    let speech = Arc::new(RecordingSpeech::default());
    let factory = Arc::new(MemoryFactory {
        opener: Arc::new(opener),
        llm: llm.clone(),
        speech: speech.clone(),
    });
    let manager = LifecycleManager::new(
        Arc::new(MemoryConfigSource::new(config)),
        factory,
        Arc::new(CountingEjector::default()),
        ShutdownManager::new(),
    );

    manager.start().await.unwrap();
    let mut device = devices.recv().await.unwrap();
    let addr = manager.control_addr().await.unwrap();
    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .unwrap();

    // 语音控制
    client
        .send(WsMessage::Text(r#"{"type":"setVolume","value":30}"#.to_string()))
        .await
        .unwrap();
    for _ in 0..100 {
        if !speech.commands().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(speech.commands(), vec![SpeechCommand::SetVolume(30)]);

    // 纯文本帧 -> 对话 -> 设备命令
    client
        .send(WsMessage::Text("turn on the suction cup".to_string()))
        .await
        .unwrap();
    assert_eq!(device.recv_raw().await.as_deref(), Some("M2231 V1\n"));
    let reply = next_frame_containing(&mut client, "\"reply\"").await;
    assert_eq!(reply["reply"]["kind"], "function_result");
    assert_eq!(reply["reply"]["name"], "start_suction");
    assert_eq!(llm.request_count(), 1);

    // 设备通知推送给客户端
    device.send_line("temp:37").await;
    let notification = next_frame_containing(&mut client, "\"notification\"").await;
    assert_eq!(notification["notification"]["value"], "37 °C");

    // 配置状态只回给请求方
    client
        .send(WsMessage::Text(r#"{"type":"config-status"}"#.to_string()))
        .await
        .unwrap();
    let status = next_frame_containing(&mut client, "config-status").await;
    assert_eq!(status["functions"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(status["device_state"], "connected");

    manager.stop(false).await;
    assert!(!manager.is_running().await);
    // 串口被关闭：设备端读到 EOF
    assert_eq!(device.recv_raw().await, None);
}
