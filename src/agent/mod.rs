//! 智能体层：配置、钩子管线、基座与 trait、直接对话智能体

pub mod base;
pub mod chat;
pub mod config;
pub mod hook;

pub use base::{Agent, AgentCore, AgentStatus};
pub use chat::ChatAgent;
pub use config::{AgentConfig, MemoryType, ReasoningMode};
pub use hook::{HookContext, HookFn, HookTable, HookType};
