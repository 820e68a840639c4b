//! Core history entities: sessions, messages, derived statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::title;

/// ID prefix for sessions.
pub const SESSION_ID_PREFIX: &str = "session_";

/// ID prefix for messages.
pub const MESSAGE_ID_PREFIX: &str = "msg_";

/// Maximum length (in chars) of the preview stored on a session.
pub const PREVIEW_MAX_CHARS: usize = 100;

/// One conversation thread between a user and the assistant.
///
/// The id is either server-assigned or locally generated while the session is
/// still pending creation on the remote side. Denormalized fields
/// (`message_count`, `last_message`, `updated_at`) are maintained by the store
/// on every message append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub message_count: usize,
    /// Preview of the newest message, truncated to [`PREVIEW_MAX_CHARS`].
    #[serde(default)]
    pub last_message: String,
    /// Free-form metadata (tool settings, pending markers, ...).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Session {
    /// Create a new session for a user with a locally generated id.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self::with_id(format!("{}{}", SESSION_ID_PREFIX, Ulid::new()), user_id)
    }

    /// Create a session with an explicit (e.g. server-assigned) id.
    #[must_use]
    pub fn with_id(id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            title: title::DEFAULT_TITLE.to_string(),
            created_at: now,
            updated_at: now,
            message_count: 0,
            last_message: String::new(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// The author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// A recorded tool call the assistant made while producing a reply.
///
/// Parameters and result are opaque JSON payloads; the result stays `None`
/// until the matching end event arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// One turn in a session.
///
/// Messages are immutable once persisted. `incomplete` marks an assistant
/// reply whose stream was aborted or cancelled before it finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub incomplete: bool,
}

impl Message {
    /// Create a message with a freshly generated id.
    #[must_use]
    pub fn new(session_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: generate_message_id(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            incomplete: false,
        }
    }

    /// Create a user message.
    #[must_use]
    pub fn user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::User, content)
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::Assistant, content)
    }
}

/// Generate a unique message id.
#[must_use]
pub fn generate_message_id() -> String {
    format!("{}{}", MESSAGE_ID_PREFIX, Ulid::new())
}

/// Derived, read-only statistics for a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub total_messages: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub first_message_time: Option<DateTime<Utc>>,
    pub last_message_time: Option<DateTime<Utc>>,
    /// Average content length in chars, rounded to nearest.
    pub avg_message_length: usize,
}

impl SessionStats {
    /// Compute statistics over an ordered message slice.
    #[must_use]
    pub fn compute(messages: &[Message]) -> Self {
        let user_messages = messages.iter().filter(|m| m.role == Role::User).count();
        let assistant_messages = messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count();
        let avg_message_length = if messages.is_empty() {
            0
        } else {
            let total: usize = messages.iter().map(|m| m.content.chars().count()).sum();
            (total as f64 / messages.len() as f64).round() as usize
        };

        Self {
            total_messages: messages.len(),
            user_messages,
            assistant_messages,
            first_message_time: messages.first().map(|m| m.timestamp),
            last_message_time: messages.last().map(|m| m.timestamp),
            avg_message_length,
        }
    }
}

/// Sort messages by timestamp, preserving insertion order on ties.
pub fn sort_by_timestamp(messages: &mut [Message]) {
    messages.sort_by_key(|m| m.timestamp);
}
