//! 智能体基座：AgentCore（身份、配置、钩子、有界记忆、活跃状态）与 Agent trait
//!
//! Agent::call 是唯一的对外入口，固定执行：
//! pre_reply 钩子 -> observe(输入) -> reply -> post_reply 钩子 -> observe(回复)。
//! 具体智能体只实现 reply。

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::agent::hook::{run_hooks, HookContext, HookFn, HookTable, HookType};
use crate::agent::{AgentConfig, MemoryType};
use crate::core::AgentError;
use crate::memory::{BoundedMemory, MemoryStore, Message};

#[derive(Debug, Clone)]
struct Activity {
    is_active: bool,
    last_activity: DateTime<Utc>,
}

/// 智能体的公开状态（list_agents 使用）
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub id: String,
    pub name: String,
    pub role: String,
    pub capabilities: Vec<String>,
    pub tools: Vec<String>,
    pub model_name: String,
    pub is_active: bool,
    pub last_activity: DateTime<Utc>,
    pub memory_size: usize,
}

pub struct AgentCore {
    id: String,
    config: AgentConfig,
    hooks: RwLock<HookTable>,
    memory: Mutex<Box<dyn MemoryStore>>,
    activity: Mutex<Activity>,
}

impl AgentCore {
    pub fn new(config: AgentConfig) -> Self {
        let memory: Box<dyn MemoryStore> = match config.memory_type {
            MemoryType::Bounded => Box::new(BoundedMemory::new(config.max_memory_size)),
        };
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            hooks: RwLock::new(HookTable::new()),
            memory: Mutex::new(memory),
            activity: Mutex::new(Activity {
                is_active: true,
                last_activity: Utc::now(),
            }),
        }
    }

    /// 指定 id（测试或从外部恢复时使用）
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// 替换记忆实现
    pub fn with_memory(self, memory: Box<dyn MemoryStore>) -> Self {
        *self.memory.lock().unwrap_or_else(PoisonError::into_inner) = memory;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn memory(&self) -> MutexGuard<'_, Box<dyn MemoryStore>> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn activity(&self) -> MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.activity().is_active
    }

    pub fn set_active(&self, active: bool) {
        self.activity().is_active = active;
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.activity().last_activity
    }

    pub fn touch(&self) {
        self.activity().last_activity = Utc::now();
    }

    pub fn register_hook(&self, hook_type: HookType, name: impl Into<String>, hook: HookFn) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(hook_type, name, hook);
    }

    /// 以字符串指定生命周期点注册；未知类型返回 InvalidHookType
    pub fn register_hook_by_name(
        &self,
        hook_type: &str,
        name: impl Into<String>,
        hook: HookFn,
    ) -> Result<(), AgentError> {
        let t: HookType = hook_type.parse()?;
        self.register_hook(t, name, hook);
        Ok(())
    }

    pub fn remove_hook(&self, hook_type: HookType, name: &str) -> bool {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(hook_type, name)
    }

    pub fn clear_hooks(&self, hook_type: Option<HookType>) {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear(hook_type);
    }

    pub fn hook_names(&self, hook_type: HookType) -> Vec<String> {
        self.hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .names(hook_type)
    }

    pub fn run_hooks(&self, hook_type: HookType, message: Message) -> Message {
        let hooks = self
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot(hook_type);
        if hooks.is_empty() {
            return message;
        }
        let ctx = HookContext {
            agent_id: &self.id,
            agent_name: &self.config.name,
            hook_type,
        };
        run_hooks(&hooks, &ctx, message)
    }

    /// 记录一条消息：pre_observe 钩子 -> 写入记忆 -> post_observe 钩子
    pub fn observe(&self, message: &Message) {
        let stored = self.run_hooks(HookType::PreObserve, message.clone());
        self.memory().add_message(stored.role(), &stored.text());
        self.run_hooks(HookType::PostObserve, stored);
    }

    /// 按顺序记录多条消息
    pub fn observe_many(&self, messages: &[Message]) {
        for m in messages {
            self.observe(m);
        }
    }

    pub fn memory_text(&self, limit: Option<usize>) -> String {
        self.memory().get_conversation_text(limit)
    }

    pub fn memory_size(&self) -> usize {
        self.memory().get_message_count()
    }

    pub fn clear_memory(&self) {
        self.memory().clear();
    }

    pub fn status(&self) -> AgentStatus {
        let activity = self.activity().clone();
        AgentStatus {
            id: self.id.clone(),
            name: self.config.name.clone(),
            role: self.config.role.clone(),
            capabilities: self.config.capabilities.iter().cloned().collect(),
            tools: self.config.tools.iter().cloned().collect(),
            model_name: self.config.model_name.clone(),
            is_active: activity.is_active,
            last_activity: activity.last_activity,
            memory_size: self.memory_size(),
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn core(&self) -> &AgentCore;

    /// 具体智能体的回复逻辑
    async fn reply(&self, message: Message) -> Result<Message, AgentError>;

    fn id(&self) -> &str {
        self.core().id()
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    /// 完整调用管线
    async fn call(&self, message: Message) -> Result<Message, AgentError> {
        let core = self.core();
        if !core.is_active() {
            return Err(AgentError::AgentInactive(core.id().to_string()));
        }
        core.touch();
        let message = core.run_hooks(HookType::PreReply, message);
        core.observe(&message);
        let reply = self.reply(message).await?;
        let reply = core.run_hooks(HookType::PostReply, reply);
        core.observe(&reply);
        core.touch();
        Ok(reply)
    }
}
