//! 智能体配置：名称、角色、模型参数、能力与工具集合、记忆与推理模式

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::AgentSection;

/// 推理模式；每种模式对应一段固定的引导语
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningMode {
    ChainOfThought,
    StepByStep,
    Direct,
}

impl ReasoningMode {
    pub fn guidance(&self) -> &'static str {
        match self {
            ReasoningMode::ChainOfThought => {
                "请先逐步写出你的思考过程，再决定是否调用工具或直接给出答案。"
            }
            ReasoningMode::StepByStep => {
                "请按子任务顺序逐个推进：每一轮只完成一个步骤，并说明下一步要做什么。"
            }
            ReasoningMode::Direct => "请直接给出结论；只有在确实缺少信息时才调用工具。",
        }
    }
}

/// 记忆实现类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// 有界内存记忆（默认）
    Bounded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub role: String,
    pub system_prompt: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub capabilities: BTreeSet<String>,
    /// 允许使用的工具；为空表示不限
    pub tools: BTreeSet<String>,
    pub memory_type: MemoryType,
    pub max_memory_size: usize,
    pub reasoning_mode: ReasoningMode,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self::from_defaults(&AgentSection::default(), name, role)
    }

    /// 以 [agent] 配置段为默认值创建
    pub fn from_defaults(
        defaults: &AgentSection,
        name: impl Into<String>,
        role: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let role = role.into();
        Self {
            system_prompt: format!("You are {name}, acting as {role}."),
            name,
            role,
            model_name: defaults.model_name.clone(),
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
            capabilities: BTreeSet::new(),
            tools: BTreeSet::new(),
            memory_type: MemoryType::Bounded,
            max_memory_size: defaults.max_memory_size,
            reasoning_mode: defaults.reasoning_mode,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.insert(tool.into());
        self
    }

    pub fn with_max_memory_size(mut self, size: usize) -> Self {
        self.max_memory_size = size;
        self
    }

    pub fn with_reasoning_mode(mut self, mode: ReasoningMode) -> Self {
        self.reasoning_mode = mode;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn allows_tool(&self, tool: &str) -> bool {
        self.tools.is_empty() || self.tools.contains(tool)
    }
}
