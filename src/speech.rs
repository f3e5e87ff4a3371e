//! 语音前端
//!
//! 语音合成与识别不在本进程内实现，而是两个可选的外部子进程，都从 stdin 逐行读取 JSON 命令：
//! - 合成：`{"tts":"pause"}`、`{"tts":"resume"}`、`{"volume":N}`、`{"text":"..."}`
//! - 识别：`{"STT":"pause"}`、`{"STT":"resume"}`；stdout 逐行输出
//!   `{"confirmedText":"..."}` 或 `{"interimResult":"..."}`

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::config::SpeechSection;
use crate::core::AgentError;

/// 发给语音前端的命令
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechCommand {
    Pause,
    Resume,
    /// 0..=100
    SetVolume(u8),
    Speak(String),
}

impl SpeechCommand {
    /// 合成进程的单行 JSON（不含换行）
    pub fn to_line(&self) -> String {
        let value = match self {
            SpeechCommand::Pause => json!({"tts": "pause"}),
            SpeechCommand::Resume => json!({"tts": "resume"}),
            SpeechCommand::SetVolume(v) => json!({"volume": (*v).min(100)}),
            SpeechCommand::Speak(text) => json!({"text": text}),
        };
        value.to_string()
    }

    /// 识别进程只接受暂停 / 恢复
    pub fn recognizer_line(&self) -> Option<String> {
        let state = match self {
            SpeechCommand::Pause => "pause",
            SpeechCommand::Resume => "resume",
            _ => return None,
        };
        Some(json!({ "STT": state }).to_string())
    }
}

/// 识别结果
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechInput {
    /// 一句话识别完成，作为用户输入提交
    Confirmed(String),
    /// 识别中间结果，只用于展示
    Interim(String),
}

#[derive(Deserialize)]
struct RecognizerLine {
    #[serde(rename = "confirmedText")]
    confirmed_text: Option<String>,
    #[serde(rename = "interimResult")]
    interim_result: Option<String>,
}

/// 解析识别进程输出的一行；非 JSON 或空文本返回 None
pub fn parse_recognizer_line(line: &str) -> Option<SpeechInput> {
    let parsed: RecognizerLine = serde_json::from_str(line.trim()).ok()?;
    let non_empty = |s: String| {
        let s = s.trim().to_string();
        (!s.is_empty()).then_some(s)
    };
    if let Some(text) = parsed.confirmed_text.and_then(non_empty) {
        return Some(SpeechInput::Confirmed(text));
    }
    parsed
        .interim_result
        .and_then(non_empty)
        .map(SpeechInput::Interim)
}

#[async_trait]
pub trait SpeechControl: Send + Sync {
    async fn send(&self, command: SpeechCommand) -> Result<(), AgentError>;

    /// 取走识别结果接收端（只能取一次）；没有识别前端时为 None
    fn take_inputs(&self) -> Option<mpsc::UnboundedReceiver<SpeechInput>> {
        None
    }

    /// 停止语音前端（幂等）
    async fn stop(&self);
}

/// 未配置语音前端时使用：只记录日志
#[derive(Debug, Default)]
pub struct NoopSpeech;

#[async_trait]
impl SpeechControl for NoopSpeech {
    async fn send(&self, command: SpeechCommand) -> Result<(), AgentError> {
        tracing::debug!(?command, "No speech front end configured");
        Ok(())
    }

    async fn stop(&self) {}
}

/// 单个语音子进程：stdin 下发命令，识别进程额外读取 stdout
struct SpeechProcess {
    program: String,
    child: AsyncMutex<Option<(Child, ChildStdin)>>,
    reader: Option<JoinHandle<()>>,
}

impl SpeechProcess {
    fn spawn(
        command: &[String],
        inputs: Option<mpsc::UnboundedSender<SpeechInput>>,
    ) -> Result<Self, AgentError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| AgentError::ConfigError("speech command is empty".to_string()))?;
        let stdout = if inputs.is_some() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(stdout)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::ServiceError(format!("failed to start {}: {}", program, e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::ServiceError(format!("{} has no stdin", program)))?;
        let reader = match inputs {
            Some(inputs) => {
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| AgentError::ServiceError(format!("{} has no stdout", program)))?;
                Some(tokio::spawn(read_recognizer(program.clone(), stdout, inputs)))
            }
            None => None,
        };
        tracing::info!("Speech process started: {}", program);

        Ok(Self {
            program: program.clone(),
            child: AsyncMutex::new(Some((child, stdin))),
            reader,
        })
    }

    async fn write_line(&self, line: &str) -> Result<(), AgentError> {
        let mut guard = self.child.lock().await;
        let (_, stdin) = guard
            .as_mut()
            .ok_or_else(|| AgentError::ServiceError(format!("{} stopped", self.program)))?;
        let line = format!("{}\n", line);
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::ServiceError(format!("{}: {}", self.program, e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| AgentError::ServiceError(format!("{}: {}", self.program, e)))
    }

    async fn stop(&self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
        if let Some((mut child, stdin)) = self.child.lock().await.take() {
            // 关闭 stdin 让子进程自行退出，再确保结束
            drop(stdin);
            if let Err(e) = child.kill().await {
                tracing::debug!("Speech process already exited: {}", e);
            }
            tracing::info!("Speech process stopped: {}", self.program);
        }
    }
}

async fn read_recognizer(
    program: String,
    stdout: ChildStdout,
    inputs: mpsc::UnboundedSender<SpeechInput>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_recognizer_line(&line) {
                Some(input) => {
                    if inputs.send(input).is_err() {
                        break;
                    }
                }
                None => tracing::debug!("Ignoring recognizer output: {}", line),
            },
            Ok(None) => {
                tracing::info!("{} closed its output", program);
                break;
            }
            Err(e) => {
                tracing::warn!("Failed to read from {}: {}", program, e);
                break;
            }
        }
    }
}

/// 子进程语音前端：合成与识别各自可选
pub struct ProcessSpeech {
    synthesizer: Option<SpeechProcess>,
    recognizer: Option<SpeechProcess>,
    inputs: Mutex<Option<mpsc::UnboundedReceiver<SpeechInput>>>,
}

impl ProcessSpeech {
    /// 命令为空的一侧不启动；任一侧启动失败即返回错误
    pub fn spawn(synthesizer: &[String], recognizer: &[String]) -> Result<Self, AgentError> {
        if synthesizer.is_empty() && recognizer.is_empty() {
            return Err(AgentError::ConfigError(
                "no speech command configured".to_string(),
            ));
        }
        let synthesizer = if synthesizer.is_empty() {
            None
        } else {
            Some(SpeechProcess::spawn(synthesizer, None)?)
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let (recognizer, inputs) = if recognizer.is_empty() {
            (None, None)
        } else {
            (Some(SpeechProcess::spawn(recognizer, Some(tx))?), Some(rx))
        };

        Ok(Self {
            synthesizer,
            recognizer,
            inputs: Mutex::new(inputs),
        })
    }
}

#[async_trait]
impl SpeechControl for ProcessSpeech {
    async fn send(&self, command: SpeechCommand) -> Result<(), AgentError> {
        let mut result = Ok(());
        if let (Some(recognizer), Some(line)) = (&self.recognizer, command.recognizer_line()) {
            result = recognizer.write_line(&line).await;
        }
        match &self.synthesizer {
            Some(synthesizer) => {
                let spoken = synthesizer.write_line(&command.to_line()).await;
                result.and(spoken)
            }
            None => {
                tracing::debug!(?command, "No speech synthesizer configured");
                result
            }
        }
    }

    fn take_inputs(&self) -> Option<mpsc::UnboundedReceiver<SpeechInput>> {
        self.inputs.lock().ok().and_then(|mut i| i.take())
    }

    async fn stop(&self) {
        if let Some(recognizer) = &self.recognizer {
            recognizer.stop().await;
        }
        if let Some(synthesizer) = &self.synthesizer {
            synthesizer.stop().await;
        }
    }
}

/// 根据 [speech] 段创建语音前端；启动失败时退化为 NoopSpeech
pub fn speech_from_config(speech: &SpeechSection) -> Arc<dyn SpeechControl> {
    if speech.command.is_empty() && speech.recognizer_command.is_empty() {
        return Arc::new(NoopSpeech);
    }
    match ProcessSpeech::spawn(&speech.command, &speech.recognizer_command) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            tracing::warn!("Speech front end unavailable: {}", e);
            Arc::new(NoopSpeech)
        }
    }
}

/// 记录型语音前端（测试用）：记录下发的命令，`hear` 模拟识别结果
#[derive(Debug)]
pub struct RecordingSpeech {
    commands: Mutex<Vec<SpeechCommand>>,
    stops: Mutex<usize>,
    heard: mpsc::UnboundedSender<SpeechInput>,
    inputs: Mutex<Option<mpsc::UnboundedReceiver<SpeechInput>>>,
}

impl Default for RecordingSpeech {
    fn default() -> Self {
        let (heard, inputs) = mpsc::unbounded_channel();
        Self {
            commands: Mutex::new(Vec::new()),
            stops: Mutex::new(0),
            heard,
            inputs: Mutex::new(Some(inputs)),
        }
    }
}

impl RecordingSpeech {
    pub fn commands(&self) -> Vec<SpeechCommand> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.lock().map(|s| *s).unwrap_or(0)
    }

    pub fn hear(&self, input: SpeechInput) {
        let _ = self.heard.send(input);
    }
}

#[async_trait]
impl SpeechControl for RecordingSpeech {
    async fn send(&self, command: SpeechCommand) -> Result<(), AgentError> {
        if let Ok(mut c) = self.commands.lock() {
            c.push(command);
        }
        Ok(())
    }

    fn take_inputs(&self) -> Option<mpsc::UnboundedReceiver<SpeechInput>> {
        self.inputs.lock().ok().and_then(|mut i| i.take())
    }

    async fn stop(&self) {
        if let Ok(mut s) = self.stops.lock() {
            *s += 1;
        }
    }
}
