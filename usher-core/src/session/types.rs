//! Session and message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message role in a conversation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    /// Question from the user
    User,
    /// Generated answer
    Assistant,
}

impl MessageRole {
    /// Convert to string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Self {
        match s {
            "assistant" => Self::Assistant,
            _ => Self::User,
        }
    }
}

/// A single message in a conversation session. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: Uuid,
    /// Owning session (back-reference, not an ownership edge)
    pub session_id: String,
    /// Message role (user/assistant)
    pub role: MessageRole,
    /// Message content
    pub content: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Reference identifiers backing an answer; empty for user messages
    pub sources: Vec<String>,
}

impl Message {
    /// Create a user message. User messages carry no sources.
    pub fn user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            role: MessageRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            sources: Vec::new(),
        }
    }

    /// Create an assistant message with the references that backed it.
    pub fn assistant(
        session_id: impl Into<String>,
        content: impl Into<String>,
        sources: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            role: MessageRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            sources,
        }
    }

    /// Message age relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }
}

/// Summary of one session's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Opaque session ID
    pub session_id: String,
    /// When the session saw its first message
    pub created_at: DateTime<Utc>,
    /// When the session was last touched
    pub last_activity: DateTime<Utc>,
    /// Messages currently retained
    pub message_count: usize,
}

/// Store-wide counters, for status reporting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStoreStats {
    /// Sessions currently held
    pub total_sessions: usize,
    /// Messages currently held across all sessions
    pub total_messages: usize,
    /// Configured per-session history bound
    pub max_history_size: usize,
    /// Configured retention period in seconds
    pub retention_period_secs: u64,
}
