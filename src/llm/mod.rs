//! LLM 层：客户端抽象、故障转移包装与 Mock 实现

pub mod failover;
pub mod mock;
pub mod traits;

pub use failover::FailoverLlmClient;
pub use mock::{MockLlmClient, RecordedCall, ScriptedLlmClient};
pub use traits::{
    ChatMessage, ChatOptions, ChatResponse, LlmClient, LlmError, TaskType, TokenUsage,
};
