//! 对话引擎
//!
//! 一次 exchange：把输入轮次与完整历史发给模型 -> 文本则结束；函数调用则经路由器执行，
//! 需要回送的结果作为 function 轮次进入下一跳，否则直接结束；模型错误直接结束，不自动重试。
//! 跳数受 max_hops 限制；history 的互斥锁同时串行化所有 exchange（语音、控制面、设备通知可能并发触发）。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use crate::config::AppConfig;
use crate::conversation::EngineEvent;
use crate::core::AgentError;
use crate::functions::{FunctionCall, FunctionResult, FunctionRouter};
use crate::llm::{LlmClient, ModelReply};
use crate::memory::{ConversationHistory, ConversationTurn, Role, TurnContent};
use crate::transport::DeviceNotification;

/// 一次 exchange 的最终结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExchangeReply {
    Text { text: String },
    FunctionResult { name: String, result: FunctionResult },
    Error { message: String },
}

impl ExchangeReply {
    fn error(e: AgentError) -> Self {
        ExchangeReply::Error {
            message: e.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ExchangeReply::Error { .. })
    }
}

/// 一次提交
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub role: Role,
    pub name: Option<String>,
    pub content: TurnContent,
    /// false 时本轮只随请求发送，不写入历史
    pub persist: bool,
}

impl SubmitRequest {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            name: None,
            content: TurnContent::text(text),
            persist: true,
        }
    }

    /// 图片从不写入历史
    pub fn image(data_url: impl Into<String>, prompt: Option<String>) -> Self {
        Self {
            role: Role::User,
            name: None,
            content: TurnContent::Image {
                data_url: data_url.into(),
                prompt,
            },
            persist: false,
        }
    }

    /// 设备通知以 system 轮次转给模型，不进入历史
    pub fn notification(notification: &DeviceNotification) -> Self {
        Self {
            role: Role::System,
            name: None,
            content: TurnContent::text(notification.to_system_text()),
            persist: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// 单次 exchange 内最多执行的函数调用数
    pub max_hops: usize,
    pub request_timeout: Duration,
}

impl EngineSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_hops: cfg.app.max_function_hops,
            request_timeout: Duration::from_secs(cfg.llm.timeouts.request),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

pub struct ConversationEngine {
    llm: Arc<dyn LlmClient>,
    router: Arc<FunctionRouter>,
    history: Mutex<ConversationHistory>,
    settings: EngineSettings,
    events: broadcast::Sender<EngineEvent>,
}

impl ConversationEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        router: Arc<FunctionRouter>,
        history: ConversationHistory,
        settings: EngineSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            llm,
            router,
            history: Mutex::new(history),
            settings,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// 向所有订阅者推送事件（无订阅者时忽略）
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    pub fn router(&self) -> &Arc<FunctionRouter> {
        &self.router
    }

    pub async fn submit_text(&self, text: impl Into<String>) -> ExchangeReply {
        self.submit(SubmitRequest::user_text(text)).await
    }

    pub async fn relay_notification(&self, notification: &DeviceNotification) -> ExchangeReply {
        self.submit(SubmitRequest::notification(notification)).await
    }

    /// 执行一次完整 exchange 并广播最终结果
    pub async fn submit(&self, request: SubmitRequest) -> ExchangeReply {
        let reply = self.run_exchange(request).await;
        self.publish(EngineEvent::Reply {
            reply: reply.clone(),
        });
        reply
    }

    pub async fn history(&self) -> Vec<ConversationTurn> {
        self.history.lock().await.turns().to_vec()
    }

    /// 清空到配置种子
    pub async fn reset(&self) {
        self.history.lock().await.reset();
    }

    async fn run_exchange(&self, request: SubmitRequest) -> ExchangeReply {
        let mut history = self.history.lock().await;

        let is_image = request.content.is_image();
        let persist_first = request.persist && !is_image;
        // 本次 exchange 的轮次（按顺序），结束时把可持久化的写回历史
        let mut exchange = vec![(
            ConversationTurn::new(request.role, request.name, request.content),
            persist_first,
        )];
        let declarations = self.router.declarations();
        let functions = (!is_image).then_some(declarations.as_slice());
        let mut hops = 0usize;

        let reply = loop {
            let turns: Vec<ConversationTurn> = history
                .turns()
                .iter()
                .cloned()
                .chain(exchange.iter().map(|(t, _)| t.clone()))
                .collect();

            self.publish(EngineEvent::Thinking { hop: hops });
            let model_reply = match tokio::time::timeout(
                self.settings.request_timeout,
                self.llm.complete(&turns, functions),
            )
            .await
            {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => break ExchangeReply::error(AgentError::ServiceError(e.to_string())),
                Err(_) => {
                    break ExchangeReply::error(AgentError::ServiceError(format!(
                        "no response within {}s",
                        self.settings.request_timeout.as_secs()
                    )))
                }
            };

            match model_reply {
                ModelReply::Error(message) => {
                    tracing::warn!(%message, "Model returned an error");
                    break ExchangeReply::error(AgentError::ServiceError(message));
                }
                ModelReply::Text(text) => {
                    exchange.push((ConversationTurn::assistant(text.clone()), true));
                    break ExchangeReply::Text { text };
                }
                ModelReply::FunctionCall { name, arguments } => {
                    if hops >= self.settings.max_hops {
                        tracing::warn!(function = %name, max_hops = self.settings.max_hops, "Function hop limit reached");
                        break ExchangeReply::Error {
                            message: format!(
                                "function hop limit ({}) reached at {}",
                                self.settings.max_hops, name
                            ),
                        };
                    }
                    hops += 1;

                    self.publish(EngineEvent::FunctionCall {
                        name: name.clone(),
                        arguments: arguments.clone(),
                    });
                    exchange.push((ConversationTurn::function(&name, arguments.to_string()), true));

                    let call = FunctionCall {
                        name: name.clone(),
                        arguments,
                    };
                    let outcome = self.router.dispatch(&call).await;
                    self.publish(EngineEvent::FunctionResult {
                        name: name.clone(),
                        result: outcome.result.clone(),
                    });

                    if outcome.result.error {
                        exchange.push((ConversationTurn::function(&name, outcome.result.to_json()), true));
                        break ExchangeReply::FunctionResult {
                            name,
                            result: outcome.result,
                        };
                    }

                    exchange.push((ConversationTurn::function(&name, outcome.result.to_json()), true));
                    if !outcome.round_trip {
                        break ExchangeReply::FunctionResult {
                            name,
                            result: outcome.result,
                        };
                    }
                    tracing::debug!(function = %name, hop = hops, "Feeding function result back to model");
                }
            }
        };

        for (turn, persist) in exchange {
            if persist {
                history.push(turn);
            }
        }
        reply
    }
}
