//! Durable conversation history storage.
//!
//! This module defines the `HistoryStore` trait plus two backends:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Orchestrator / CLI                     │
//! └───────────────────────────┬─────────────────────────────┘
//!                             │ uses trait
//!                             ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │              store/ (HistoryStore trait)                │
//! └───────────────────────────┬─────────────────────────────┘
//!                             │ implementations
//!                             ▼
//! ┌────────────────────────┐  ┌───────────────────────────┐
//! │   MemoryHistoryStore   │  │     FileHistoryStore      │
//! │   (tests, ephemeral)   │  │ (session.yaml + JSONL)    │
//! └────────────────────────┘  └───────────────────────────┘
//! ```
//!
//! # Naming conventions
//!
//! - `put` - create or update (upsert semantics, idempotent by id)
//! - `list` / `search` - enumerate, most-recently-updated first
//! - `delete` - remove a session and cascade to its messages

pub mod error;
pub mod types;

mod file;
mod memory;

pub use error::{StorageError, StorageResult};
pub use file::FileHistoryStore;
pub use memory::MemoryHistoryStore;
pub use types::{
    MESSAGE_ID_PREFIX, Message, PREVIEW_MAX_CHARS, Role, SESSION_ID_PREFIX, Session, SessionStats,
    ToolInvocation, generate_message_id,
};

use async_trait::async_trait;

/// Persistent, indexed storage for sessions and their messages.
///
/// All operations are safe to retry; `put_session` and `put_message` are
/// idempotent when called with the same identity. One writer at a time is
/// serialized per session; readers run concurrently.
///
/// `put_message` does NOT check that the owning session exists: the session
/// reference is not enforced, so a message may land for a session deleted
/// concurrently. Cleanup is the delete path's responsibility.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Upsert a session by id.
    async fn put_session(&self, session: Session) -> StorageResult<Session>;

    /// Look up a session by id.
    async fn get_session(&self, session_id: &str) -> StorageResult<Option<Session>>;

    /// Append a message; generates an id when the given one is empty.
    ///
    /// Updates the owning session's denormalized fields (message count,
    /// preview, `updated_at`) when that session exists.
    async fn put_message(&self, session_id: &str, message: Message) -> StorageResult<Message>;

    /// All messages of a session, ordered by timestamp (insertion order on
    /// ties). Empty for an unknown session.
    async fn messages(&self, session_id: &str) -> StorageResult<Vec<Message>>;

    /// Sessions of a user, most-recently-updated first, at most `limit`.
    async fn list_sessions(&self, user_id: &str, limit: usize) -> StorageResult<Vec<Session>>;

    /// Case-insensitive substring search over title and preview.
    ///
    /// An empty query degenerates to `list_sessions` semantics.
    async fn search_sessions(&self, user_id: &str, query: &str) -> StorageResult<Vec<Session>>;

    /// Remove a session and all its messages.
    ///
    /// Atomic from the caller's perspective: after a crash mid-delete either
    /// both are gone or both still present (file backend: mark-then-sweep).
    /// Deleting an unknown session is a no-op.
    async fn delete_session(&self, session_id: &str) -> StorageResult<()>;

    /// Replace a session's title. Fails with `NotFound` when absent.
    async fn update_session_title(&self, session_id: &str, title: &str)
    -> StorageResult<Session>;

    /// Derived statistics, computed on demand.
    async fn session_stats(&self, session_id: &str) -> StorageResult<SessionStats>;
}
