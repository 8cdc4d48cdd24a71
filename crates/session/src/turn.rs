use std::time::{SystemTime, UNIX_EPOCH};

use parlor_llm::{ProviderMessage, StreamTarget};
use parlor_storage::{MessageRecord, MessageRole, MessageStatus, NewMessage};

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Synthetic context. Never shown in a transcript and never stored.
    System,
    User,
    Assistant,
}

impl From<Role> for parlor_llm::Role {
    fn from(role: Role) -> Self {
        match role {
            Role::System => Self::System,
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
        }
    }
}

/// Lifecycle status for one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnStatus {
    Pending,
    Streaming(StreamTarget),
    Complete,
    Aborted,
    Errored,
}

impl TurnStatus {
    /// Terminal statuses freeze the turn's content for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Aborted | Self::Errored)
    }

    pub fn is_streaming(self) -> bool {
        matches!(self, Self::Streaming(_))
    }
}

/// One role-tagged message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// Creation instant in unix milliseconds.
    pub timestamp_ms: u64,
    pub status: TurnStatus,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>, status: TurnStatus) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp_ms: now_unix_millis(),
            status,
        }
    }

    /// User turns are complete the moment they are submitted.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, TurnStatus::Complete)
    }

    /// Empty assistant placeholder created before the stream opens.
    pub fn assistant_pending() -> Self {
        Self::new(Role::Assistant, String::new(), TurnStatus::Pending)
    }

    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn to_provider_message(&self) -> ProviderMessage {
        ProviderMessage::new(self.role.into(), self.content.clone())
    }

    /// Storage form of this turn, or `None` when it must never be persisted.
    pub fn to_new_message(&self) -> Option<NewMessage> {
        let role = match self.role {
            Role::User => MessageRole::User,
            Role::Assistant => MessageRole::Assistant,
            Role::System => return None,
        };
        let status = match self.status {
            TurnStatus::Complete => MessageStatus::Complete,
            TurnStatus::Aborted => MessageStatus::Aborted,
            TurnStatus::Pending | TurnStatus::Streaming(_) | TurnStatus::Errored => return None,
        };

        Some(NewMessage {
            role,
            status,
            content: self.content.clone(),
            created_at_unix_millis: self.timestamp_ms,
        })
    }

    pub fn from_record(record: MessageRecord) -> Self {
        let role = match record.role {
            MessageRole::User => Role::User,
            MessageRole::Assistant => Role::Assistant,
        };
        let status = match record.status {
            MessageStatus::Complete => TurnStatus::Complete,
            MessageStatus::Aborted => TurnStatus::Aborted,
        };

        Self {
            role,
            content: record.content,
            timestamp_ms: record.created_at_unix_millis,
            status,
        }
    }
}

pub(crate) fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}
