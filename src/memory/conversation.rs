//! 消息模型：智能体之间传递的不可变值对象
//!
//! Message 创建后不再修改；with_* 系列方法总是返回一条新消息。
//! to_dict / from_dict 通过 serde_json::Value 往返，供会话历史与外部接口使用。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 带类型的内容块
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        url: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// 消息内容：纯文本，或有序的内容块列表
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// 文本视图：内容块中仅拼接 Text 与 ToolResult
    pub fn to_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::ToolResult { content, .. } => Some(content.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

impl From<Vec<ContentBlock>> for MessageContent {
    fn from(blocks: Vec<ContentBlock>) -> Self {
        MessageContent::Blocks(blocks)
    }
}

/// 单条消息：id / 发送者名称 / 角色 / 内容 / 元数据 / 时间戳
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    name: String,
    role: Role,
    content: MessageContent,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
    timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(name: impl Into<String>, role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            role,
            content: content.into(),
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new("user", Role::User, content)
    }

    pub fn assistant(name: impl Into<String>, content: impl Into<MessageContent>) -> Self {
        Self::new(name, Role::Assistant, content)
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new("system", Role::System, content)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &MessageContent {
        &self.content
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// 内容的纯文本视图
    pub fn text(&self) -> String {
        self.content.to_text()
    }

    /// 返回一条替换了内容的新消息（新 id、新时间戳，保留 name / role / metadata）
    pub fn with_content(&self, content: impl Into<MessageContent>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: self.name.clone(),
            role: self.role,
            content: content.into(),
            metadata: self.metadata.clone(),
            timestamp: Utc::now(),
        }
    }

    /// 返回一条追加了元数据的新消息；id 不变，视为同一消息的注解
    pub fn with_metadata(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut next = self.clone();
        next.metadata.insert(key.into(), value.into());
        next
    }

    pub fn to_dict(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_dict(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}
