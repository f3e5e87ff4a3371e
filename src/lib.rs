//! Armlink - 让语言模型通过串口驱动外设的对话引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）与配置来源
//! - **core**: 错误类型、应用生命周期、配置监视、关闭信号
//! - **conversation**: 对话引擎（有界多跳循环、事件广播）
//! - **functions**: 设备函数目录、参数 Schema 与调用路由
//! - **gateway**: WebSocket 控制面
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话历史
//! - **transport**: 串口行协议通道、通知映射、测试替身
//! - **speech** / **media**: 语音前端与介质弹出的外部协作者

pub mod config;
pub mod conversation;
pub mod core;
pub mod functions;
pub mod gateway;
pub mod llm;
pub mod media;
pub mod memory;
pub mod observability;
pub mod speech;
pub mod transport;
