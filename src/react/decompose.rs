//! 任务分解
//!
//! 复杂度判定是可配置策略：字符数超过阈值，或包含任一关键词（不区分大小写）。
//! 复杂任务先请求 LLM 给出编号列表；LLM 失败或列表为空时使用启发式拆分，至少产出一个子步骤。

use std::sync::OnceLock;

use regex::Regex;

use crate::config::DecompositionSection;
use crate::llm::{ChatMessage, ChatOptions, LlmClient, TaskType};

static LIST_ITEM_RE: OnceLock<Option<Regex>> = OnceLock::new();

const HEURISTIC_SEPARATORS: [&str; 9] = ["and then", "然后", "并且", "并", "；", ";", "，", ",", "。"];

const DECOMPOSE_PROMPT: &str =
    "你是任务规划助手。把用户的任务拆分为 2 到 6 个有序子步骤，每行一个，格式为「1. 子步骤」，不要输出其他内容。";

#[derive(Debug, Clone)]
pub struct DecompositionPolicy {
    pub enabled: bool,
    pub length_threshold: usize,
    pub keywords: Vec<String>,
}

impl Default for DecompositionPolicy {
    fn default() -> Self {
        Self::from(&DecompositionSection::default())
    }
}

impl From<&DecompositionSection> for DecompositionPolicy {
    fn from(s: &DecompositionSection) -> Self {
        Self {
            enabled: s.enabled,
            length_threshold: s.length_threshold,
            keywords: s.keywords.clone(),
        }
    }
}

impl DecompositionPolicy {
    pub fn is_complex(&self, task: &str) -> bool {
        if !self.enabled {
            return false;
        }
        if task.chars().count() > self.length_threshold {
            return true;
        }
        let lower = task.to_lowercase();
        self.keywords
            .iter()
            .any(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
    }

    /// 分解任务；只在 is_complex 为真时由推理循环调用
    pub async fn decompose(
        &self,
        llm: &dyn LlmClient,
        task: &str,
        options: &ChatOptions,
    ) -> Vec<String> {
        let messages = [ChatMessage::system(DECOMPOSE_PROMPT), ChatMessage::user(task)];
        let options = options.clone().with_task_type(TaskType::Decomposition);
        match llm.chat(&messages, &options).await {
            Ok(resp) => {
                let steps = parse_substeps(&resp.content);
                if !steps.is_empty() {
                    return steps;
                }
                tracing::debug!("decomposition reply has no list items, using heuristic split");
            }
            Err(e) => tracing::warn!(error = %e, "decomposition call failed, using heuristic split"),
        }
        heuristic_split(task)
    }
}

/// 解析编号或项目符号列表（"1. xx" / "2) xx" / "3、xx" / "- xx"）
pub fn parse_substeps(text: &str) -> Vec<String> {
    let Some(re) = LIST_ITEM_RE
        .get_or_init(|| Regex::new(r"^\s*(?:\d+[\.\)、]|[-*•])\s*(.+)$").ok())
        .as_ref()
    else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|line| re.captures(line))
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|s| !s.is_empty())
        .collect()
}

/// 按连接词与标点拆分；拆不开时整个任务作为唯一子步骤
pub fn heuristic_split(task: &str) -> Vec<String> {
    let mut text = task.to_string();
    for sep in HEURISTIC_SEPARATORS {
        text = text.replace(sep, "\n");
    }
    let parts: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if parts.len() >= 2 {
        parts
    } else {
        vec![task.trim().to_string()]
    }
}
