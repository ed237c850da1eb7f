//! 智能体会话记忆：有界、按时间顺序，超出上限时淘汰最旧条目
//!
//! MemoryStore 是智能体消费的记忆契约；BoundedMemory 为默认的内存实现。

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::memory::Role;

/// 记忆中的一条 (role, content)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub role: Role,
    pub content: String,
}

/// 记忆契约：追加、按条数导出文本、计数、清空
pub trait MemoryStore: Send + Sync {
    fn add_message(&mut self, role: Role, content: &str);

    /// 最近 limit 条（None 为全部）拼成 "role: content" 文本
    fn get_conversation_text(&self, limit: Option<usize>) -> String;

    fn get_message_count(&self) -> usize;

    fn clear(&mut self);
}

/// 有界记忆：最多保留 max_size 条最新记录
#[derive(Clone, Debug)]
pub struct BoundedMemory {
    entries: VecDeque<MemoryEntry>,
    max_size: usize,
}

impl BoundedMemory {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_size.min(256)),
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn entries(&self) -> impl Iterator<Item = &MemoryEntry> {
        self.entries.iter()
    }

    fn prune(&mut self) {
        while self.entries.len() > self.max_size {
            self.entries.pop_front();
        }
    }
}

impl MemoryStore for BoundedMemory {
    fn add_message(&mut self, role: Role, content: &str) {
        self.entries.push_back(MemoryEntry {
            role,
            content: content.to_string(),
        });
        self.prune();
    }

    fn get_conversation_text(&self, limit: Option<usize>) -> String {
        let n = limit.unwrap_or(self.entries.len()).min(self.entries.len());
        self.entries
            .iter()
            .skip(self.entries.len() - n)
            .map(|e| format!("{}: {}", e.role, e.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn get_message_count(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}
