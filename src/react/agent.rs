//! ReActAgent：以 ReasoningLoop 实现 reply 的智能体
//!
//! 每次 reply 开始时清空上一次的推理记录；回复消息的 metadata 带 confidence / iterations / substeps。

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::agent::{Agent, AgentConfig, AgentCore};
use crate::core::AgentError;
use crate::memory::Message;
use crate::react::{ReasoningLoop, ReasoningRecord, ReasoningTrace};

pub struct ReActAgent {
    core: AgentCore,
    reasoning: ReasoningLoop,
    last_trace: Mutex<Option<ReasoningTrace>>,
}

impl ReActAgent {
    pub fn new(config: AgentConfig, reasoning: ReasoningLoop) -> Self {
        Self::with_core(AgentCore::new(config), reasoning)
    }

    pub fn with_core(core: AgentCore, reasoning: ReasoningLoop) -> Self {
        Self {
            core,
            reasoning,
            last_trace: Mutex::new(None),
        }
    }

    /// 最近一次 reply 的完整轨迹
    pub fn last_trace(&self) -> Option<ReasoningTrace> {
        self.last_trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 最近一次 reply 的逐轮推理记录
    pub fn reasoning_log(&self) -> Vec<ReasoningRecord> {
        self.last_trace()
            .map(|t| t.records)
            .unwrap_or_default()
    }
}

#[async_trait]
impl Agent for ReActAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn reply(&self, message: Message) -> Result<Message, AgentError> {
        *self
            .last_trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        let memory = self
            .core
            .memory_text(Some(self.reasoning.memory_context_messages()));
        let trace = self
            .reasoning
            .run(&message.text(), self.core.config(), &memory)
            .await?;

        let reply = Message::assistant(self.core.name(), trace.response.clone())
            .with_metadata("confidence", trace.confidence)
            .with_metadata("iterations", trace.iterations())
            .with_metadata("substeps", trace.substeps.clone());
        *self
            .last_trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(trace);
        Ok(reply)
    }
}
