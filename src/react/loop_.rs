//! ReAct 主循环
//!
//! 复杂任务先分解 -> REASON（拼上下文，请求结构化决策）-> ACT（执行工具）-> OBSERVE（写回观察）-> 下一轮 REASON；
//! finished / 不用工具 / 达到 max_iterations 时结束，最后综合整段推理历史给出回复。
//! 工具缺失或执行失败是终止性的：结束循环，错误并入最终回复文本，不向调用方抛出。

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;

use crate::agent::AgentConfig;
use crate::config::ReactSection;
use crate::core::{AgentError, ErrorContext, ErrorHandler};
use crate::llm::{ChatMessage, ChatOptions, LlmClient, TaskType};
use crate::observability::{tags, PerformanceMonitor};
use crate::react::{
    compute_confidence, decision_format_hint, parse_decision, DecompositionPolicy, ReasoningStep,
};
use crate::tools::{ToolExecutor, ToolOutput};

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 500;

const SYNTHESIS_PROMPT: &str =
    "你是总结助手。根据下面的任务、子步骤与推理过程，给出完整、直接的最终回答，不要复述推理过程本身。";

/// 每轮迭代一条记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReasoningRecord {
    pub iteration: usize,
    pub reasoning_text: String,
    pub used_tool: bool,
    pub tool_name: Option<String>,
    pub confidence: Option<f64>,
}

/// ACT 阶段的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Success { tool: String, data: Value },
    Failure { tool: String, error: String },
}

impl ActionOutcome {
    /// 折叠进下一轮上下文的自然语言观察
    pub fn observation(&self) -> String {
        match self {
            ActionOutcome::Success { tool, data } => {
                let text = match data {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                format!("工具 {} 返回：{}", tool, preview(&text, OBSERVATION_PREVIEW_CHARS))
            }
            ActionOutcome::Failure { tool, error } => format!("工具 {} 执行失败：{}", tool, error),
        }
    }
}

fn preview(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}

/// 一次 run 的完整轨迹
#[derive(Debug, Clone, Serialize)]
pub struct ReasoningTrace {
    pub task: String,
    pub substeps: Vec<String>,
    pub records: Vec<ReasoningRecord>,
    pub observations: Vec<String>,
    pub actions: Vec<ActionOutcome>,
    pub response: String,
    pub confidence: f64,
    pub synthesized: bool,
}

impl ReasoningTrace {
    pub fn iterations(&self) -> usize {
        self.records.len()
    }

    pub fn used_tool(&self) -> bool {
        self.records.iter().any(|r| r.used_tool)
    }
}

pub struct ReasoningLoop {
    llm: Arc<dyn LlmClient>,
    tools: Option<ToolExecutor>,
    decomposition: DecompositionPolicy,
    max_iterations: usize,
    memory_context_messages: usize,
    error_handler: Option<Arc<ErrorHandler>>,
    monitor: Option<Arc<PerformanceMonitor>>,
}

impl ReasoningLoop {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self::from_config(llm, &ReactSection::default())
    }

    pub fn from_config(llm: Arc<dyn LlmClient>, cfg: &ReactSection) -> Self {
        Self {
            llm,
            tools: None,
            decomposition: DecompositionPolicy::from(&cfg.decomposition),
            max_iterations: cfg.max_iterations,
            memory_context_messages: cfg.memory_context_messages,
            error_handler: None,
            monitor: None,
        }
    }

    pub fn with_tools(mut self, tools: ToolExecutor) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_decomposition(mut self, policy: DecompositionPolicy) -> Self {
        self.decomposition = policy;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn memory_context_messages(&self) -> usize {
        self.memory_context_messages
    }

    /// 执行一次完整的 ReAct 推理；memory 为已格式化的近期对话
    pub async fn run(
        &self,
        task: &str,
        config: &AgentConfig,
        memory: &str,
    ) -> Result<ReasoningTrace, AgentError> {
        let options = ChatOptions {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            task_type: TaskType::Reasoning,
        };

        let substeps = if self.decomposition.is_complex(task) {
            let steps = self
                .decomposition
                .decompose(self.llm.as_ref(), task, &options)
                .await;
            tracing::info!(agent = %config.name, substeps = steps.len(), "task decomposed");
            steps
        } else {
            Vec::new()
        };

        let mut trace = ReasoningTrace {
            task: task.to_string(),
            substeps,
            records: Vec::new(),
            observations: Vec::new(),
            actions: Vec::new(),
            response: String::new(),
            confidence: 0.0,
            synthesized: false,
        };
        let mut last_response = String::new();
        let mut terminal_failure: Option<ActionOutcome> = None;

        for iteration in 1..=self.max_iterations {
            let context = self.build_context(&trace, config, memory, iteration);
            let messages = [
                ChatMessage::system(config.system_prompt.clone()),
                ChatMessage::user(context),
            ];
            let raw = self.llm.chat(&messages, &options).await?.content;
            let decision = parse_decision(&raw);
            last_response = decision.response_text();

            let step = decision.step();
            let tool_name = match &step {
                ReasoningStep::UseTool { tool_name, .. } => Some(tool_name.clone()),
                ReasoningStep::Direct { .. } => None,
            };
            trace.records.push(ReasoningRecord {
                iteration,
                reasoning_text: decision.reasoning_text().to_string(),
                used_tool: tool_name.is_some(),
                tool_name,
                confidence: decision.confidence(),
            });
            tracing::debug!(agent = %config.name, iteration, "reasoning step");

            match step {
                ReasoningStep::Direct { .. } => break,
                ReasoningStep::UseTool {
                    tool_name,
                    tool_args,
                } => {
                    let outcome = self.act(config, &tool_name, tool_args, iteration).await;
                    trace.observations.push(outcome.observation());
                    trace.actions.push(outcome.clone());
                    if matches!(outcome, ActionOutcome::Failure { .. }) {
                        terminal_failure = Some(outcome);
                        break;
                    }
                    if decision.finished() {
                        break;
                    }
                }
            }
        }

        trace.response = self.finish(&mut trace, last_response).await;
        if let Some(ActionOutcome::Failure { tool, error }) = terminal_failure {
            trace.response = format!("{}\n\n（工具 {} 执行失败：{}）", trace.response, tool, error)
                .trim()
                .to_string();
        }
        trace.confidence = compute_confidence(&trace.records, trace.substeps.len());

        if let Some(m) = &self.monitor {
            m.record_histogram("react.iterations", trace.iterations() as f64, None);
            m.record_histogram("react.confidence", trace.confidence, None);
        }
        tracing::info!(
            agent = %config.name,
            iterations = trace.iterations(),
            confidence = trace.confidence,
            synthesized = trace.synthesized,
            "reasoning finished"
        );
        Ok(trace)
    }

    fn build_context(
        &self,
        trace: &ReasoningTrace,
        config: &AgentConfig,
        memory: &str,
        iteration: usize,
    ) -> String {
        let mut ctx = format!("## 任务\n{}\n", trace.task);

        if !memory.trim().is_empty() {
            ctx.push_str(&format!("\n## 近期对话\n{}\n", memory));
        }

        ctx.push_str("\n## 可用工具\n");
        let tools: Vec<(String, String)> = self
            .tools
            .as_ref()
            .map(|t| t.tool_descriptions())
            .unwrap_or_default()
            .into_iter()
            .filter(|(name, _)| config.allows_tool(name))
            .collect();
        if tools.is_empty() {
            ctx.push_str("（无）\n");
        } else {
            for (name, desc) in tools {
                ctx.push_str(&format!("- {}: {}\n", name, desc));
            }
        }

        if !trace.substeps.is_empty() {
            let total = trace.substeps.len();
            let done = (iteration - 1).min(total);
            ctx.push_str(&format!("\n## 任务分解（已完成 {}/{}）\n", done, total));
            for (i, step) in trace.substeps.iter().enumerate() {
                let mark = if i < done {
                    "[x]"
                } else if i == done {
                    "[>]"
                } else {
                    "[ ]"
                };
                ctx.push_str(&format!("{} {}. {}\n", mark, i + 1, step));
            }
        }

        if !trace.observations.is_empty() {
            ctx.push_str("\n## 已有观察\n");
            for obs in &trace.observations {
                ctx.push_str(&format!("- {}\n", obs));
            }
        }

        ctx.push_str(&format!(
            "\n## 推理要求\n{}\n{}\n",
            config.reasoning_mode.guidance(),
            decision_format_hint()
        ));
        ctx
    }

    async fn act(
        &self,
        config: &AgentConfig,
        tool_name: &str,
        args: Value,
        iteration: usize,
    ) -> ActionOutcome {
        let start = Instant::now();
        let result = match &self.tools {
            Some(tools) if config.allows_tool(tool_name) => tools.execute(tool_name, args).await,
            _ => Err(AgentError::ToolNotFound(tool_name.to_string())),
        };
        let result = match result {
            Ok(ToolOutput {
                success: true,
                data,
                ..
            }) => Ok(data.unwrap_or(Value::Null)),
            Ok(ToolOutput { error, .. }) => Err(AgentError::ToolExecutionFailed {
                tool: tool_name.to_string(),
                reason: error.unwrap_or_else(|| "unknown error".to_string()),
            }),
            Err(e) => Err(e),
        };

        if let Some(m) = &self.monitor {
            let outcome = if result.is_ok() { "ok" } else { "error" };
            let t = tags([("tool", tool_name), ("outcome", outcome)]);
            m.increment_counter("tool.calls", 1.0, Some(t.clone()));
            m.record_timer("tool.duration", start.elapsed(), Some(t));
        }

        match result {
            Ok(data) => ActionOutcome::Success {
                tool: tool_name.to_string(),
                data,
            },
            Err(e) => {
                tracing::warn!(agent = %config.name, tool = tool_name, error = %e, "tool action failed");
                if let Some(handler) = &self.error_handler {
                    let mut ctx = ErrorContext::new();
                    ctx.insert("agent".into(), Value::String(config.name.clone()));
                    ctx.insert("tool".into(), Value::String(tool_name.to_string()));
                    ctx.insert("iteration".into(), Value::from(iteration));
                    handler.handle_error(&e, ctx).await;
                }
                ActionOutcome::Failure {
                    tool: tool_name.to_string(),
                    error: e.to_string(),
                }
            }
        }
    }

    /// 综合最终回复：单轮直接作答无需综合；综合失败时退回最后一轮的原始回复
    async fn finish(&self, trace: &mut ReasoningTrace, last_response: String) -> String {
        if trace.records.is_empty() {
            return "未能在迭代预算内得出结论。".to_string();
        }
        if trace.records.len() == 1 && trace.substeps.is_empty() && !trace.used_tool() {
            return last_response;
        }

        let mut history = format!("## 任务\n{}\n", trace.task);
        if !trace.substeps.is_empty() {
            history.push_str("\n## 子步骤\n");
            for (i, step) in trace.substeps.iter().enumerate() {
                history.push_str(&format!("{}. {}\n", i + 1, step));
            }
        }
        history.push_str("\n## 推理过程\n");
        for r in &trace.records {
            match &r.tool_name {
                Some(tool) => history.push_str(&format!(
                    "第 {} 轮（调用 {}）：{}\n",
                    r.iteration, tool, r.reasoning_text
                )),
                None => history.push_str(&format!("第 {} 轮：{}\n", r.iteration, r.reasoning_text)),
            }
        }
        if !trace.observations.is_empty() {
            history.push_str("\n## 观察\n");
            for obs in &trace.observations {
                history.push_str(&format!("- {}\n", obs));
            }
        }
        if !last_response.trim().is_empty() {
            history.push_str(&format!("\n## 最后一轮回复\n{}\n", last_response));
        }

        let messages = [ChatMessage::system(SYNTHESIS_PROMPT), ChatMessage::user(history)];
        let options = ChatOptions::default().with_task_type(TaskType::Synthesis);
        match self.llm.chat(&messages, &options).await {
            Ok(resp) if !resp.content.trim().is_empty() => {
                trace.synthesized = true;
                resp.content
            }
            Ok(_) => last_response,
            Err(e) => {
                tracing::warn!(error = %e, "synthesis failed, using last reasoning response");
                if let Some(handler) = &self.error_handler {
                    let mut ctx = ErrorContext::new();
                    ctx.insert("stage".into(), Value::String("synthesis".into()));
                    handler
                        .handle_error(&AgentError::Synthesis(e.to_string()), ctx)
                        .await;
                }
                last_response
            }
        }
    }
}
