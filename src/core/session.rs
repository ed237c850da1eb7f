//! 会话历史：按 session_id 记录参与的智能体与往来消息

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::memory::Message;

#[derive(Debug, Clone, Serialize)]
pub struct SessionHistory {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub agents_used: BTreeSet<String>,
    pub messages: Vec<Message>,
}

impl SessionHistory {
    fn new(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            created_at: now,
            last_activity: now,
            agents_used: BTreeSet::new(),
            messages: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionHistory>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一次交互；会话不存在时创建
    pub fn record<'a>(
        &self,
        session_id: &str,
        agent_ids: impl IntoIterator<Item = &'a str>,
        messages: impl IntoIterator<Item = Message>,
    ) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionHistory::new(session_id));
        session
            .agents_used
            .extend(agent_ids.into_iter().map(String::from));
        session.messages.extend(messages);
        session.last_activity = Utc::now();
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHistory> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
            .is_some()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
