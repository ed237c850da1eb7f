//! 钩子管线：按生命周期点（pre_reply / post_reply / pre_observe / post_observe）注册的有序钩子
//!
//! 钩子可以替换消息（返回 Some）或仅做旁路处理（返回 None）；
//! 单个钩子失败或 panic 只记日志并跳过，不会中断智能体调用。

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    PreReply,
    PostReply,
    PreObserve,
    PostObserve,
}

impl HookType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::PreReply => "pre_reply",
            HookType::PostReply => "post_reply",
            HookType::PreObserve => "pre_observe",
            HookType::PostObserve => "post_observe",
        }
    }
}

impl FromStr for HookType {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre_reply" => Ok(HookType::PreReply),
            "post_reply" => Ok(HookType::PostReply),
            "pre_observe" => Ok(HookType::PreObserve),
            "post_observe" => Ok(HookType::PostObserve),
            other => Err(AgentError::InvalidHookType(other.to_string())),
        }
    }
}

/// 钩子被调用时能看到的智能体信息
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub agent_id: &'a str,
    pub agent_name: &'a str,
    pub hook_type: HookType,
}

/// 钩子函数：Ok(Some(msg)) 替换消息，Ok(None) 保持不变，Err 记日志后跳过
pub type HookFn =
    Arc<dyn Fn(&HookContext<'_>, &Message) -> Result<Option<Message>, String> + Send + Sync>;

#[derive(Default, Clone)]
pub struct HookTable {
    hooks: HashMap<HookType, Vec<(String, HookFn)>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同名钩子原位替换，否则追加到末尾
    pub fn register(&mut self, hook_type: HookType, name: impl Into<String>, hook: HookFn) {
        let name = name.into();
        let list = self.hooks.entry(hook_type).or_default();
        match list.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = hook,
            None => list.push((name, hook)),
        }
    }

    pub fn remove(&mut self, hook_type: HookType, name: &str) -> bool {
        let Some(list) = self.hooks.get_mut(&hook_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|(n, _)| n != name);
        list.len() != before
    }

    pub fn clear(&mut self, hook_type: Option<HookType>) {
        match hook_type {
            Some(t) => {
                self.hooks.remove(&t);
            }
            None => self.hooks.clear(),
        }
    }

    pub fn names(&self, hook_type: HookType) -> Vec<String> {
        self.hooks
            .get(&hook_type)
            .map(|l| l.iter().map(|(n, _)| n.clone()).collect())
            .unwrap_or_default()
    }

    /// 该生命周期点的钩子快照（执行时不持有锁）
    pub fn snapshot(&self, hook_type: HookType) -> Vec<(String, HookFn)> {
        self.hooks.get(&hook_type).cloned().unwrap_or_default()
    }
}

/// 依次执行钩子；每个钩子看到上一个钩子的输出
pub fn run_hooks(hooks: &[(String, HookFn)], ctx: &HookContext<'_>, message: Message) -> Message {
    let mut current = message;
    for (name, hook) in hooks {
        match catch_unwind(AssertUnwindSafe(|| hook(ctx, &current))) {
            Ok(Ok(Some(next))) => current = next,
            Ok(Ok(None)) => {}
            Ok(Err(e)) => tracing::warn!(
                agent_id = ctx.agent_id,
                hook = %name,
                hook_type = ctx.hook_type.as_str(),
                error = %e,
                "hook failed, skipped"
            ),
            Err(_) => tracing::error!(
                agent_id = ctx.agent_id,
                hook = %name,
                hook_type = ctx.hook_type.as_str(),
                "hook panicked, skipped"
            ),
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> HookContext<'static> {
        HookContext {
            agent_id: "a1",
            agent_name: "tester",
            hook_type: HookType::PreReply,
        }
    }

    fn suffix(s: &'static str) -> HookFn {
        Arc::new(move |_: &HookContext<'_>, m: &Message| -> Result<Option<Message>, String> {
            Ok(Some(m.with_content(format!("{}{}", m.text(), s))))
        })
    }

    #[test]
    fn test_hooks_run_in_order() {
        let mut table = HookTable::new();
        table.register(HookType::PreReply, "a", suffix("-a"));
        table.register(HookType::PreReply, "b", suffix("-b"));
        let out = run_hooks(&table.snapshot(HookType::PreReply), &ctx(), Message::user("x"));
        assert_eq!(out.text(), "x-a-b");
    }

    #[test]
    fn test_failing_and_panicking_hooks_are_skipped() {
        let mut table = HookTable::new();
        table.register(
            HookType::PreReply,
            "bad",
            Arc::new(|_: &HookContext<'_>, _: &Message| -> Result<Option<Message>, String> {
                Err("nope".to_string())
            }),
        );
        table.register(
            HookType::PreReply,
            "panic",
            Arc::new(|_: &HookContext<'_>, _: &Message| -> Result<Option<Message>, String> {
                panic!("boom")
            }),
        );
        table.register(HookType::PreReply, "ok", suffix("!"));
        let out = run_hooks(&table.snapshot(HookType::PreReply), &ctx(), Message::user("hi"));
        assert_eq!(out.text(), "hi!");
    }

    #[test]
    fn test_register_same_name_replaces() {
        let mut table = HookTable::new();
        table.register(HookType::PostReply, "h", suffix("1"));
        table.register(HookType::PostReply, "h", suffix("2"));
        assert_eq!(table.names(HookType::PostReply), vec!["h".to_string()]);
        assert!(table.remove(HookType::PostReply, "h"));
        assert!(!table.remove(HookType::PostReply, "h"));
    }

    #[test]
    fn test_parse_hook_type() {
        assert_eq!("post_observe".parse::<HookType>().unwrap(), HookType::PostObserve);
        assert!(matches!(
            "on_error".parse::<HookType>(),
            Err(AgentError::InvalidHookType(t)) if t == "on_error"
        ));
    }
}
