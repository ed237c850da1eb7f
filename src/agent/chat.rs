//! ChatAgent：不带工具的直接对话智能体
//!
//! 一次 chat 调用：system prompt（含近期记忆）+ 当前输入。适合作为协调者或纯文本角色。

use std::sync::Arc;

use async_trait::async_trait;

use crate::agent::{Agent, AgentConfig, AgentCore};
use crate::core::AgentError;
use crate::llm::{ChatMessage, ChatOptions, LlmClient, TaskType};
use crate::memory::Message;

/// 拼接上下文时带入的最近记忆条数
const MEMORY_CONTEXT_MESSAGES: usize = 10;

pub struct ChatAgent {
    core: AgentCore,
    llm: Arc<dyn LlmClient>,
}

impl ChatAgent {
    pub fn new(config: AgentConfig, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            core: AgentCore::new(config),
            llm,
        }
    }

    pub fn with_core(core: AgentCore, llm: Arc<dyn LlmClient>) -> Self {
        Self { core, llm }
    }
}

#[async_trait]
impl Agent for ChatAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn reply(&self, message: Message) -> Result<Message, AgentError> {
        let cfg = self.core.config();
        let history = self.core.memory_text(Some(MEMORY_CONTEXT_MESSAGES));
        let system = if history.is_empty() {
            cfg.system_prompt.clone()
        } else {
            format!("{}\n\n## 近期对话\n{}", cfg.system_prompt, history)
        };
        let options = ChatOptions {
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            task_type: TaskType::Chat,
        };
        let messages = [ChatMessage::system(system), ChatMessage::user(message.text())];
        let response = self.llm.chat(&messages, &options).await?;
        tracing::debug!(agent_id = %self.core.id(), provider = self.llm.provider_name(), "chat reply");
        let mut reply = Message::assistant(cfg.name.clone(), response.content);
        if let Some(usage) = response.usage {
            reply = reply.with_metadata("total_tokens", usage.total_tokens);
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, ScriptedLlmClient};

    #[tokio::test]
    async fn test_chat_agent_replies_with_llm_content() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push_ok("你好").await;
        let agent = ChatAgent::new(AgentConfig::new("greeter", "assistant"), llm.clone());
        let reply = agent.call(Message::user("hi")).await.unwrap();
        assert_eq!(reply.text(), "你好");
        assert_eq!(reply.name(), "greeter");
        let calls = llm.calls().await;
        assert_eq!(calls[0].messages.last().unwrap().content, "hi");
    }

    #[tokio::test]
    async fn test_chat_agent_surfaces_llm_error() {
        let llm = Arc::new(ScriptedLlmClient::new());
        llm.push(Err(LlmError::Network("down".into()))).await;
        let agent = ChatAgent::new(AgentConfig::new("greeter", "assistant"), llm);
        let err = agent.call(Message::user("hi")).await.unwrap_err();
        assert!(matches!(err, AgentError::Llm(LlmError::Network(_))));
        // 失败时输入已进入记忆，回复没有
        assert_eq!(agent.core().memory_size(), 1);
    }
}
