//! Mock / 脚本化 LLM 客户端（用于测试与演示，无需 API）
//!
//! - MockLlmClient：按 task_type 给出确定性回复，便于本地跑通 ReAct 与协作流程
//! - ScriptedLlmClient：按预设脚本依次返回，并记录每次调用，供测试断言调用顺序

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::llm::{ChatMessage, ChatOptions, ChatResponse, LlmClient, LlmError, TaskType};
use crate::memory::Role;

fn last_user(messages: &[ChatMessage]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("(no input)")
}

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        let input = last_user(messages);
        let preview: String = input.chars().take(80).collect();
        let content = match options.task_type {
            TaskType::Decomposition => format!("1. 理解任务：{preview}\n2. 收集要点\n3. 给出结论"),
            TaskType::Reasoning => serde_json::json!({
                "reasoning": "任务可以直接回答",
                "use_tool": false,
                "response": format!("Echo from Mock: {preview}"),
                "finished": true,
                "confidence": 0.8
            })
            .to_string(),
            TaskType::Synthesis => format!("Summary from Mock: {preview}"),
            TaskType::Planning => format!("Plan from Mock: {preview}"),
            TaskType::Chat => format!("Echo from Mock: {preview}"),
        };
        Ok(ChatResponse::text(content))
    }

    fn provider_name(&self) -> &str {
        "mock"
    }
}

/// 一次被记录的调用
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub task_type: TaskType,
    pub messages: Vec<ChatMessage>,
}

/// 脚本化客户端：优先按 task_type 取脚本，其次取通用队列，都为空时返回默认回复
#[derive(Debug)]
pub struct ScriptedLlmClient {
    queue: Mutex<VecDeque<Result<String, LlmError>>>,
    by_task: Mutex<HashMap<TaskType, VecDeque<Result<String, LlmError>>>>,
    calls: Mutex<Vec<RecordedCall>>,
    default_reply: String,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            by_task: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            default_reply: "ok".to_string(),
        }
    }

    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    /// 追加到通用队列
    pub async fn push(&self, reply: Result<String, LlmError>) {
        self.queue.lock().await.push_back(reply);
    }

    pub async fn push_ok(&self, reply: impl Into<String>) {
        self.push(Ok(reply.into())).await;
    }

    /// 追加到指定 task_type 的队列
    pub async fn push_for(&self, task_type: TaskType, reply: Result<String, LlmError>) {
        self.by_task
            .lock()
            .await
            .entry(task_type)
            .or_default()
            .push_back(reply);
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self, task_type: TaskType) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.task_type == task_type)
            .count()
    }
}

impl Default for ScriptedLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        self.calls.lock().await.push(RecordedCall {
            task_type: options.task_type,
            messages: messages.to_vec(),
        });
        let scripted = match self
            .by_task
            .lock()
            .await
            .get_mut(&options.task_type)
            .and_then(|q| q.pop_front())
        {
            Some(r) => Some(r),
            None => self.queue.lock().await.pop_front(),
        };
        match scripted {
            Some(Ok(text)) => Ok(ChatResponse::text(text)),
            Some(Err(e)) => Err(e),
            None => Ok(ChatResponse::text(self.default_reply.clone())),
        }
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_prefers_task_queue() {
        let llm = ScriptedLlmClient::new();
        llm.push_ok("general").await;
        llm.push_for(TaskType::Synthesis, Ok("synth".into())).await;
        let opts = ChatOptions::default().with_task_type(TaskType::Synthesis);
        let r = llm.chat(&[ChatMessage::user("x")], &opts).await.unwrap();
        assert_eq!(r.content, "synth");
        let r = llm.chat(&[ChatMessage::user("x")], &opts).await.unwrap();
        assert_eq!(r.content, "general");
        let r = llm.chat(&[ChatMessage::user("x")], &opts).await.unwrap();
        assert_eq!(r.content, "ok");
        assert_eq!(llm.call_count(TaskType::Synthesis).await, 3);
    }

    #[tokio::test]
    async fn test_mock_reasoning_is_structured() {
        let opts = ChatOptions::default().with_task_type(TaskType::Reasoning);
        let r = MockLlmClient
            .chat(&[ChatMessage::user("hi")], &opts)
            .await
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&r.content).unwrap();
        assert_eq!(v["use_tool"], false);
    }
}
