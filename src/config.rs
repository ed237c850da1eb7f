//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEEHIVE__*` 覆盖（双下划线表示嵌套，如 `BEEHIVE__REACT__MAX_ITERATIONS=5`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::agent::ReasoningMode;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub agent: AgentSection,
    pub react: ReactSection,
    pub recovery: RecoverySection,
    pub circuit_breaker: CircuitBreakerSection,
    pub monitor: MonitorSection,
    pub tools: ToolsSection,
    pub orchestrator: OrchestratorSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "beehive".to_string(),
        }
    }
}

/// [agent] 段：新建智能体时的默认参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_memory_size: usize,
    pub reasoning_mode: ReasoningMode,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            model_name: "deepseek-chat".to_string(),
            max_tokens: 2048,
            temperature: 0.7,
            max_memory_size: 100,
            reasoning_mode: ReasoningMode::ChainOfThought,
        }
    }
}

/// [react] 段：ReAct 循环预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReactSection {
    pub max_iterations: usize,
    /// 拼接推理上下文时带入的最近记忆条数
    pub memory_context_messages: usize,
    pub decomposition: DecompositionSection,
}

impl Default for ReactSection {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            memory_context_messages: 10,
            decomposition: DecompositionSection::default(),
        }
    }
}

/// [react.decomposition] 段：复杂任务判定（长度阈值 + 关键词）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecompositionSection {
    pub enabled: bool,
    /// 按字符数计
    pub length_threshold: usize,
    pub keywords: Vec<String>,
}

impl Default for DecompositionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            length_threshold: 50,
            keywords: default_complexity_keywords(),
        }
    }
}

fn default_complexity_keywords() -> Vec<String> {
    [
        "分析", "比较", "评估", "设计", "规划", "步骤", "并给出", "然后", "优缺点",
        "analyze", "compare", "evaluate", "design", "plan", "step by step", "and then",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// [recovery] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub max_recovery_attempts: u32,
    /// 退避时间单位（毫秒）
    pub backoff_unit_ms: u64,
    pub max_history: usize,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 3,
            backoff_unit_ms: 1000,
            max_history: 1000,
        }
    }
}

/// [circuit_breaker] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    pub timeout_secs: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_secs: 60,
        }
    }
}

/// [monitor] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub sample_interval_secs: u64,
    /// 每个指标序列保留的最大点数
    pub max_series_points: usize,
    /// 系统采样滚动窗口大小
    pub system_window: usize,
    /// 同一告警规则两次触发的最小间隔
    pub alert_cooldown_secs: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            sample_interval_secs: 30,
            max_series_points: 1000,
            system_window: 120,
            alert_cooldown_secs: 60,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
        }
    }
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 全局保留的协作记录条数
    pub max_collaboration_history: usize,
    /// call_agent 失败时是否以原消息重试
    pub retry_agent_calls: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_collaboration_history: 500,
            retry_agent_calls: true,
        }
    }
}

/// 从 config 目录加载配置，环境变量 BEEHIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEEHIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEEHIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.react.max_iterations, 10);
        assert_eq!(cfg.recovery.max_recovery_attempts, 3);
        assert_eq!(cfg.monitor.alert_cooldown_secs, 60);
        assert!(cfg.react.decomposition.keywords.iter().any(|k| k == "分析"));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[react]\nmax_iterations = 4\n\n[agent]\nreasoning_mode = \"step_by_step\"\n\n[circuit_breaker]\nfailure_threshold = 2"
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.react.max_iterations, 4);
        assert_eq!(cfg.react.memory_context_messages, 10);
        assert_eq!(cfg.agent.reasoning_mode, ReasoningMode::StepByStep);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 2);
        assert_eq!(cfg.circuit_breaker.timeout_secs, 60);
    }
}
