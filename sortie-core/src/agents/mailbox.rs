//! Inter-agent messages, per-agent mailboxes and the wake policy

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AgentId;
use crate::state::WaitReason;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Query,
    Instruction,
    #[default]
    Information,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Query => "query",
            MessageType::Instruction => "instruction",
            MessageType::Information => "information",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "query" => Some(MessageType::Query),
            "instruction" => Some(MessageType::Instruction),
            "information" | "info" => Some(MessageType::Information),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl MessagePriority {
    pub fn as_str(self) -> &'static str {
        match self {
            MessagePriority::Low => "low",
            MessagePriority::Normal => "normal",
            MessagePriority::High => "high",
            MessagePriority::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(MessagePriority::Low),
            "normal" => Some(MessagePriority::Normal),
            "high" => Some(MessagePriority::High),
            "urgent" => Some(MessagePriority::Urgent),
            _ => None,
        }
    }
}

/// Origin of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSender {
    /// The human operator
    User,
    Agent(AgentId),
    /// Scan-level notices with no originating agent
    System,
}

impl fmt::Display for MessageSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageSender::User => f.write_str("user"),
            MessageSender::Agent(id) => write!(f, "{id}"),
            MessageSender::System => f.write_str("system"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: MessageSender,
    pub to: AgentId,
    pub body: String,
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(from: MessageSender, to: AgentId, body: impl Into<String>) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            from,
            to,
            body: body.into(),
            message_type: MessageType::default(),
            priority: MessagePriority::default(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Render the message for injection into the recipient's conversation
    pub fn render(&self, sender_name: Option<&str>) -> String {
        match &self.from {
            MessageSender::User => self.body.clone(),
            MessageSender::System => format!("<system_notice>\n{}\n</system_notice>", self.body),
            MessageSender::Agent(id) => {
                let sender = match sender_name {
                    Some(name) => format!("{name} ({id})"),
                    None => id.to_string(),
                };
                format!(
                    "<inter_agent_message>\n<sender>{sender}</sender>\n<type>{}</type>\n<priority>{}</priority>\n<timestamp>{}</timestamp>\n<content>\n{}\n</content>\n</inter_agent_message>",
                    self.message_type.as_str(),
                    self.priority.as_str(),
                    self.timestamp.to_rfc3339(),
                    self.body
                )
            }
        }
    }
}

/// Ordered per-agent inbox; delivery is FIFO
#[derive(Debug, Default)]
pub struct Mailbox {
    queue: VecDeque<Message>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.queue.push_back(message);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn peek_all(&self) -> impl Iterator<Item = &Message> {
        self.queue.iter()
    }

    pub fn drain_all(&mut self) -> Vec<Message> {
        self.queue.drain(..).collect()
    }
}

/// Whether a waiting agent should resume when `sender` delivers a message.
///
/// Ordinary waits resume on anything. After a model failure the agent resumes
/// only for the user or its parent; the root (no parent) also resumes for any
/// sub-agent. Scan notices never wake a failed agent.
pub fn should_resume(reason: &WaitReason, parent: Option<&AgentId>, sender: &MessageSender) -> bool {
    if !reason.is_llm_failed() {
        return true;
    }
    match sender {
        MessageSender::User => true,
        MessageSender::System => false,
        MessageSender::Agent(from) => match parent {
            Some(parent) => from == parent,
            None => true,
        },
    }
}
