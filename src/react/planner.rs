//! 推理决策解析
//!
//! 每轮 REASON 要求 LLM 输出 JSON 决策：
//! {"reasoning", "use_tool", "tool_name", "tool_args", "response", "finished", "confidence"}。
//! parse_decision 从文本中提取 JSON（```json 块或首个 { 到末个 }），解析失败时退化为
//! Fallback：整段文本即最终回复，不使用工具。解析本身永不失败。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// LLM 给出的结构化决策
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuredDecision {
    pub reasoning: String,
    pub use_tool: bool,
    pub tool_name: Option<String>,
    pub tool_args: Value,
    pub response: Option<String>,
    pub finished: bool,
    pub confidence: Option<f64>,
}

/// 一轮推理的解析结果
#[derive(Debug, Clone, PartialEq)]
pub enum ReasoningDecision {
    Structured(StructuredDecision),
    /// 非结构化输出：整段文本作为最终回复
    Fallback { text: String },
}

/// 决策落到的下一步
#[derive(Debug, Clone, PartialEq)]
pub enum ReasoningStep {
    UseTool { tool_name: String, tool_args: Value },
    Direct { response: String },
}

impl ReasoningDecision {
    pub fn step(&self) -> ReasoningStep {
        match self {
            ReasoningDecision::Structured(d) => match (d.use_tool, d.tool_name.as_deref()) {
                (true, Some(name)) if !name.trim().is_empty() => ReasoningStep::UseTool {
                    tool_name: name.trim().to_string(),
                    tool_args: d.tool_args.clone(),
                },
                _ => ReasoningStep::Direct {
                    response: self.response_text(),
                },
            },
            ReasoningDecision::Fallback { text } => ReasoningStep::Direct {
                response: text.clone(),
            },
        }
    }

    pub fn reasoning_text(&self) -> &str {
        match self {
            ReasoningDecision::Structured(d) => &d.reasoning,
            ReasoningDecision::Fallback { text } => text,
        }
    }

    /// 本轮给出的回复文本；结构化决策未给 response 时退回 reasoning
    pub fn response_text(&self) -> String {
        match self {
            ReasoningDecision::Structured(d) => d
                .response
                .as_deref()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or(&d.reasoning)
                .to_string(),
            ReasoningDecision::Fallback { text } => text.clone(),
        }
    }

    pub fn finished(&self) -> bool {
        match self {
            ReasoningDecision::Structured(d) => d.finished,
            ReasoningDecision::Fallback { .. } => true,
        }
    }

    /// LLM 自报的置信度，截断到 [0, 1]
    pub fn confidence(&self) -> Option<f64> {
        match self {
            ReasoningDecision::Structured(d) => d
                .confidence
                .filter(|c| c.is_finite())
                .map(|c| c.clamp(0.0, 1.0)),
            ReasoningDecision::Fallback { .. } => None,
        }
    }
}

fn extract_json(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// 至少带一个决策字段的对象才视为决策；回答里嵌入的普通 JSON 不算
const DECISION_KEYS: [&str; 4] = ["reasoning", "use_tool", "response", "finished"];

fn decode_decision(json: &str) -> Option<StructuredDecision> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    let obj = value.as_object()?;
    if !DECISION_KEYS.iter().any(|k| obj.contains_key(*k)) {
        return None;
    }
    serde_json::from_value(value).ok()
}

pub fn parse_decision(output: &str) -> ReasoningDecision {
    let trimmed = output.trim();
    let parsed = extract_json(trimmed).and_then(decode_decision);
    match parsed {
        Some(d) => ReasoningDecision::Structured(d),
        None => {
            tracing::debug!("reasoning output is not a structured decision, using text fallback");
            ReasoningDecision::Fallback {
                text: trimmed.to_string(),
            }
        }
    }
}

/// 决策 JSON 格式说明（拼入 REASON 上下文）
pub fn decision_format_hint() -> &'static str {
    r#"请只输出一个 JSON 对象，格式如下：
{"reasoning": "本轮思考", "use_tool": false, "tool_name": null, "tool_args": {}, "response": "给用户的回答", "finished": true, "confidence": 0.8}
需要调用工具时 use_tool 为 true，并给出 tool_name 与 tool_args。"#
}
