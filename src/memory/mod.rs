//! 记忆层：消息模型与智能体有界会话记忆

pub mod agent_memory;
pub mod conversation;

pub use agent_memory::{BoundedMemory, MemoryEntry, MemoryStore};
pub use conversation::{ContentBlock, Message, MessageContent, Role};
