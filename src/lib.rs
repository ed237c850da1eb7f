//! Beehive - Rust 多智能体推理与编排系统
//!
//! 模块划分：
//! - **agent**: 智能体配置、钩子管线、AgentCore 与 Agent trait、直接对话智能体
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与恢复、熔断器、会话记录、多智能体编排
//! - **llm**: LLM 客户端抽象、Mock 与多提供方故障转移
//! - **memory**: 消息模型与有界会话记忆
//! - **observability**: 日志初始化、指标、系统采样与告警
//! - **react**: 任务分解、ReAct 推理循环、置信度评估
//! - **tools**: 工具契约、注册表与带超时的执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::{Agent, AgentConfig, AgentCore, ChatAgent, HookType};
pub use config::{load_config, AppConfig};
pub use core::{AgentError, AgentOrchestrator, CollaborationStrategy, ErrorHandler};
pub use memory::{Message, Role};
pub use observability::PerformanceMonitor;
pub use react::{ReActAgent, ReasoningLoop};
