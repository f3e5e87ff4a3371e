//! 应用配置：从 config/default.toml、显式配置文件与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ARMLINK__*` 覆盖（双下划线表示嵌套，如 `ARMLINK__DEVICE__VENDOR=Arduino`）。
//! `AppConfig` 实现 `PartialEq`，热更新时按完整结构比较决定是否重启。

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::functions::DeviceFunctionSpec;
use crate::memory::Role;
use crate::transport::NotificationMapping;

/// 环境变量前缀
pub const ENV_PREFIX: &str = "ARMLINK";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub server: ServerSection,
    pub device: DeviceSection,
    pub llm: LlmSection,
    pub conversation: ConversationSection,
    pub watcher: WatcherSection,
    pub speech: SpeechSection,
    pub media: MediaSection,
    /// 设备函数目录（[[functions]]）
    pub functions: Vec<DeviceFunctionSpec>,
    /// 设备通知映射（[notifications.<key>]）
    pub notifications: BTreeMap<String, NotificationMapping>,
}

/// [app] 段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 单次对话内最多执行的函数调用次数，防止模型反复要求读取
    pub max_function_hops: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_function_hops: 5,
        }
    }
}

/// [server] 段：WebSocket 控制面
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub enabled: bool,
    pub bind_addr: String,
    /// 关闭时等待客户端断开的上限（秒），超时后强制关闭
    pub shutdown_timeout_secs: u64,
    /// 重启时 teardown 完成后到重新 start 的延迟（毫秒）
    pub restart_delay_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: "127.0.0.1:8765".to_string(),
            shutdown_timeout_secs: 5,
            restart_delay_ms: 1000,
        }
    }
}

/// [device] 段：串口设备
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    /// 显式串口路径；未设置时按 vendor 枚举
    pub port: Option<String>,
    /// USB 厂商/产品字符串匹配（不区分大小写）
    pub vendor: String,
    pub baud_rate: u32,
    /// read 等待回复的超时（毫秒）
    pub read_timeout_ms: u64,
    /// 断线后重连间隔（秒）
    pub reconnect_interval_secs: u64,
    /// name-value 负载中 name 与 value 之间的分隔符；空串即直接拼接
    pub value_delimiter: String,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            port: None,
            vendor: "Arduino".to_string(),
            baud_rate: 115_200,
            read_timeout_ms: 3000,
            reconnect_interval_secs: 10,
            value_delimiter: ":".to_string(),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai（任意 OpenAI 兼容端点）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    pub api_key_env: String,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [conversation] 段：对话种子（通常是一条 system 提示）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSection {
    pub seed: Vec<SeedTurn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedTurn {
    pub role: Role,
    pub content: String,
}

/// [watcher] 段：配置变化轮询
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSection {
    pub enabled: bool,
    pub poll_interval_secs: u64,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 5,
        }
    }
}

/// [speech] 段：语音合成与语音识别子进程（stdin 按行接收 JSON）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechSection {
    /// 合成程序与参数，如 ["python3", "scriptTTS.py"]；为空时不启动
    pub command: Vec<String>,
    /// 识别程序与参数，如 ["python3", "scriptSTT.py"]；stdout 逐行输出识别结果
    pub recognizer_command: Vec<String>,
    /// 是否朗读助手的文本回复
    pub speak_replies: bool,
}

impl Default for SpeechSection {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            recognizer_command: Vec::new(),
            speak_replies: true,
        }
    }
}

/// [media] 段：配置未变化时执行的弹出命令
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaSection {
    pub eject_command: Vec<String>,
}

impl AppConfig {
    /// 启动前校验；返回的错误均为 SetupFatal
    pub fn validate(&self) -> Result<(), AgentError> {
        let mut seen = HashSet::new();
        for spec in &self.functions {
            if spec.name.trim().is_empty() {
                return Err(AgentError::SetupFatal(
                    "device function with empty name".to_string(),
                ));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(AgentError::SetupFatal(format!(
                    "duplicate device function: {}",
                    spec.name
                )));
            }
        }
        if self.notifications.keys().any(|k| k.trim().is_empty()) {
            return Err(AgentError::SetupFatal(
                "notification mapping with empty key".to_string(),
            ));
        }
        if self.device.read_timeout_ms == 0 || self.device.reconnect_interval_secs == 0 {
            return Err(AgentError::SetupFatal(
                "device timeouts must be positive".to_string(),
            ));
        }
        if self.app.max_function_hops == 0 {
            return Err(AgentError::SetupFatal(
                "app.max_function_hops must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 ARMLINK__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ARMLINK__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 仅从单个文件加载（不叠加默认文件与环境变量），用于比较两个来源的配置内容
pub fn load_config_file(path: &std::path::Path) -> Result<AppConfig, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::from(path.to_path_buf()).required(true))
        .build()?
        .try_deserialize()
}

/// 配置来源：生命周期管理器与配置监视器只依赖此 trait
pub trait ConfigSource: Send + Sync {
    /// 读取并解析当前配置
    fn load(&self) -> Result<AppConfig, config::ConfigError>;

    /// 内容变化指纹（如文件 mtime）；None 表示来源当前不可用
    fn fingerprint(&self) -> Option<SystemTime>;

    fn describe(&self) -> String;
}

/// 基于文件的配置来源（默认文件 + 可选显式文件 + 环境变量）
#[derive(Debug, Clone, Default)]
pub struct FileConfigSource {
    path: Option<PathBuf>,
}

impl FileConfigSource {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    fn watched_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| PathBuf::from("config/default.toml"))
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<AppConfig, config::ConfigError> {
        load_config(self.path.clone())
    }

    fn fingerprint(&self) -> Option<SystemTime> {
        std::fs::metadata(self.watched_path())
            .and_then(|m| m.modified())
            .ok()
    }

    fn describe(&self) -> String {
        self.watched_path().display().to_string()
    }
}

/// 内存配置来源：set 后指纹前进（测试与嵌入使用）
#[derive(Debug, Default)]
pub struct MemoryConfigSource {
    current: Mutex<Option<AppConfig>>,
    version: AtomicU64,
}

impl MemoryConfigSource {
    pub fn new(config: AppConfig) -> Self {
        let source = Self::default();
        source.set(config);
        source
    }

    pub fn set(&self, config: AppConfig) {
        if let Ok(mut current) = self.current.lock() {
            *current = Some(config);
        }
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// 模拟来源消失（如介质被拔出）
    pub fn clear(&self) {
        if let Ok(mut current) = self.current.lock() {
            *current = None;
        }
        self.version.fetch_add(1, Ordering::SeqCst);
    }
}

impl ConfigSource for MemoryConfigSource {
    fn load(&self) -> Result<AppConfig, config::ConfigError> {
        self.current
            .lock()
            .ok()
            .and_then(|c| c.clone())
            .ok_or(config::ConfigError::NotFound("memory config".to_string()))
    }

    fn fingerprint(&self) -> Option<SystemTime> {
        let version = self.version.load(Ordering::SeqCst);
        Some(SystemTime::UNIX_EPOCH + Duration::from_secs(version))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::{InvocationMode, PayloadShape};
    use std::io::Write;

    const SAMPLE: &str = r#"
[device]
vendor = "Espressif"
read_timeout_ms = 1500

[llm]
provider = "mock"

[[conversation.seed]]
role = "system"
content = "You control a robot arm."

[[functions]]
name = "start_suction"
description = "Turn the suction cup on"
mode = "fire-and-forget"
payload = "raw-string"
command = "M2231 V1"

[[functions]]
name = "read_temp"
description = "Read the temperature sensor"
mode = "await-response"
payload = "name-value"
command = "temp"
default_value = "?"

[notifications.temp]
description = "Temperature"
type = "sensor"
"#;

    fn write_sample(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.device.baud_rate, 115_200);
        assert_eq!(cfg.device.read_timeout_ms, 3000);
        assert_eq!(cfg.device.reconnect_interval_secs, 10);
        assert_eq!(cfg.app.max_function_hops, 5);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_sample_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(&dir, "armlink.toml", SAMPLE);
        let cfg = load_config_file(&path).unwrap();

        assert_eq!(cfg.device.vendor, "Espressif");
        assert_eq!(cfg.device.read_timeout_ms, 1500);
        assert_eq!(cfg.device.baud_rate, 115_200);
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.conversation.seed.len(), 1);
        assert_eq!(cfg.conversation.seed[0].role, Role::System);
        assert_eq!(cfg.functions.len(), 2);
        assert_eq!(cfg.functions[0].mode, InvocationMode::FireAndForget);
        assert_eq!(cfg.functions[1].payload, PayloadShape::NameValue);
        assert_eq!(cfg.notifications["temp"].description, "Temperature");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_identical_content_from_two_files_is_equal() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_sample(&dir, "a.toml", SAMPLE);
        let b = write_sample(&dir, "b.toml", SAMPLE);
        assert_eq!(load_config_file(&a).unwrap(), load_config_file(&b).unwrap());

        let changed = SAMPLE.replace("M2231 V1", "M2231 V0");
        let c = write_sample(&dir, "c.toml", &changed);
        assert_ne!(load_config_file(&a).unwrap(), load_config_file(&c).unwrap());
    }

    #[test]
    fn test_duplicate_function_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let body = SAMPLE.replace("name = \"read_temp\"", "name = \"start_suction\"");
        let path = write_sample(&dir, "dup.toml", &body);
        let cfg = load_config_file(&path).unwrap();
        assert!(matches!(cfg.validate(), Err(AgentError::SetupFatal(_))));
    }

    #[test]
    fn test_shipped_default_config_is_valid() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml");
        let cfg = load_config_file(&path).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.functions.len(), 4);
        assert!(cfg.notifications["btn"].forward);
    }
}
