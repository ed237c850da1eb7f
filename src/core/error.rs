//! 错误类型、错误分类与恢复策略
//!
//! AgentError 是全系统的错误枚举；ErrorType 为封闭的十类分类，
//! 每一类对应一个有序的 RecoveryStrategy 偏好列表，由 ErrorHandler 依次尝试。

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;

/// Agent / 编排过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Invalid hook type: {0}")]
    InvalidHookType(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    #[error("Agent inactive: {0}")]
    AgentInactive(String),

    #[error("Agent failure: {0}")]
    AgentFailure(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {reason}")]
    ToolExecutionFailed { tool: String, reason: String },

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Resource exhausted: {0}")]
    Resource(String),

    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    #[error("Evidence error: {0}")]
    Evidence(String),

    #[error("Plan error: {0}")]
    Plan(String),

    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Task execution failed: {0}")]
    TaskExecution(String),
}

/// 错误分类（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    AgentFailure,
    NetworkError,
    DatabaseError,
    ValidationError,
    TimeoutError,
    ResourceError,
    TaskExecutionError,
    SynthesisError,
    EvidenceError,
    PlanError,
}

impl ErrorType {
    pub const ALL: [ErrorType; 10] = [
        ErrorType::AgentFailure,
        ErrorType::NetworkError,
        ErrorType::DatabaseError,
        ErrorType::ValidationError,
        ErrorType::TimeoutError,
        ErrorType::ResourceError,
        ErrorType::TaskExecutionError,
        ErrorType::SynthesisError,
        ErrorType::EvidenceError,
        ErrorType::PlanError,
    ];

    /// 该类错误的恢复策略偏好顺序
    pub fn preferred_strategies(&self) -> &'static [RecoveryStrategy] {
        use RecoveryStrategy::*;
        match self {
            ErrorType::AgentFailure => &[RestartAgent, Retry, Escalate],
            ErrorType::NetworkError => &[Retry, FallbackProvider, GracefulDegradation],
            ErrorType::DatabaseError => &[Retry, GracefulDegradation, Escalate],
            ErrorType::ValidationError => &[SkipTask, ManualIntervention],
            ErrorType::TimeoutError => &[Retry, FallbackProvider, GracefulDegradation],
            ErrorType::ResourceError => &[GracefulDegradation, Retry, Escalate],
            ErrorType::TaskExecutionError => &[Retry, SkipTask, Escalate],
            ErrorType::SynthesisError => &[Retry, GracefulDegradation],
            ErrorType::EvidenceError => &[Retry, SkipTask],
            ErrorType::PlanError => &[Retry, GracefulDegradation, ManualIntervention],
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorType::ValidationError | ErrorType::EvidenceError => Severity::Low,
            ErrorType::NetworkError
            | ErrorType::TimeoutError
            | ErrorType::TaskExecutionError
            | ErrorType::SynthesisError
            | ErrorType::PlanError => Severity::Medium,
            ErrorType::AgentFailure | ErrorType::ResourceError => Severity::High,
            ErrorType::DatabaseError => Severity::Critical,
        }
    }

    /// 无法从类型判断时，按错误文本关键词归类；都不匹配则为 task_execution_error
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        let has = |keys: &[&str]| keys.iter().any(|k| lower.contains(k));
        if has(&["timeout", "timed out", "超时"]) {
            ErrorType::TimeoutError
        } else if has(&["connection", "network", "dns", "网络"]) {
            ErrorType::NetworkError
        } else if has(&["database", "sql", "数据库"]) {
            ErrorType::DatabaseError
        } else if has(&["invalid", "validation", "校验"]) {
            ErrorType::ValidationError
        } else if has(&["out of memory", "resource", "quota", "资源"]) {
            ErrorType::ResourceError
        } else {
            ErrorType::TaskExecutionError
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// 恢复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    RestartAgent,
    FallbackProvider,
    GracefulDegradation,
    SkipTask,
    Escalate,
    ManualIntervention,
}

impl FromStr for RecoveryStrategy {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| AgentError::Validation(format!("unknown recovery strategy: {s}")))
    }
}

impl AgentError {
    /// 分类：先按变体，LLM/工具错误细分，其余按文本兜底
    pub fn classify(&self) -> ErrorType {
        match self {
            AgentError::AgentNotFound(_)
            | AgentError::AgentInactive(_)
            | AgentError::AgentFailure(_) => ErrorType::AgentFailure,
            AgentError::Llm(LlmError::Timeout(_)) | AgentError::ToolTimeout(_) => {
                ErrorType::TimeoutError
            }
            AgentError::Llm(_) | AgentError::CircuitOpen(_) => ErrorType::NetworkError,
            AgentError::InvalidHookType(_)
            | AgentError::DuplicateAgent(_)
            | AgentError::Validation(_)
            | AgentError::Config(_) => ErrorType::ValidationError,
            AgentError::Database(_) => ErrorType::DatabaseError,
            AgentError::Resource(_) => ErrorType::ResourceError,
            AgentError::Synthesis(_) => ErrorType::SynthesisError,
            AgentError::Evidence(_) => ErrorType::EvidenceError,
            AgentError::Plan(_) => ErrorType::PlanError,
            AgentError::ToolNotFound(_) | AgentError::ToolExecutionFailed { .. } => {
                ErrorType::TaskExecutionError
            }
            AgentError::TaskExecution(msg) => ErrorType::from_message(msg),
        }
    }
}
