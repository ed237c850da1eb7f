//! 工具执行器
//!
//! 持有 ToolInvoker 与全局超时，execute(tool_name, args) 在超时内调用工具：
//! 未知工具返回 ToolNotFound，超时返回 ToolTimeout；工具自身报告的失败以 ToolOutput 原样返回。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::tools::{Tool, ToolInvoker, ToolOutput};

/// 工具执行器：对每次调用施加超时，并记录审计日志
#[derive(Clone)]
pub struct ToolExecutor {
    invoker: Arc<dyn ToolInvoker>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(invoker: Arc<dyn ToolInvoker>, timeout: Duration) -> Self {
        Self { invoker, timeout }
    }

    pub fn with_timeout_secs(invoker: Arc<dyn ToolInvoker>, timeout_secs: u64) -> Self {
        Self::new(invoker, Duration::from_secs(timeout_secs))
    }

    pub async fn execute(&self, tool_name: &str, args: Value) -> Result<ToolOutput, AgentError> {
        let Some(tool) = self.invoker.get_tool(tool_name) else {
            audit(tool_name, false, "not_found", 0, &args);
            return Err(AgentError::ToolNotFound(tool_name.to_string()));
        };

        let start = Instant::now();
        let preview = args_preview(&args);
        let result = timeout(self.timeout, tool.execute(args)).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                let outcome = if output.success { "ok" } else { "error" };
                audit_preview(tool_name, output.success, outcome, duration_ms, &preview);
                Ok(output)
            }
            Err(_) => {
                audit_preview(tool_name, false, "timeout", duration_ms, &preview);
                Err(AgentError::ToolTimeout(tool_name.to_string()))
            }
        }
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.invoker.get_tool(name)
    }

    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.invoker.tool_descriptions()
    }
}

fn audit(tool: &str, ok: bool, outcome: &str, duration_ms: u64, args: &Value) {
    audit_preview(tool, ok, outcome, duration_ms, &args_preview(args));
}

fn audit_preview(tool: &str, ok: bool, outcome: &str, duration_ms: u64, preview: &str) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": tool,
        "ok": ok,
        "outcome": outcome,
        "duration_ms": duration_ms,
        "args_preview": preview,
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
