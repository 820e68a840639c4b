//! In-memory history store.
//!
//! Backs tests and ephemeral sessions. Uses concurrent maps so different
//! sessions never contend; operations on the same session serialize on the
//! per-key entry lock.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::error::{StorageError, StorageResult};
use super::types::{Message, PREVIEW_MAX_CHARS, Session, SessionStats, sort_by_timestamp};
use super::HistoryStore;
use crate::title::truncate_chars;

/// Volatile `HistoryStore` implementation.
#[derive(Default)]
pub struct MemoryHistoryStore {
    sessions: DashMap<String, Session>,
    messages: DashMap<String, Vec<Message>>,
}

impl MemoryHistoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn put_session(&self, session: Session) -> StorageResult<Session> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> StorageResult<Option<Session>> {
        Ok(self.sessions.get(session_id).map(|s| s.clone()))
    }

    async fn put_message(&self, session_id: &str, mut message: Message) -> StorageResult<Message> {
        if message.id.is_empty() {
            message.id = super::generate_message_id();
        }
        message.session_id = session_id.to_string();

        {
            let mut entry = self.messages.entry(session_id.to_string()).or_default();
            if let Some(existing) = entry.iter().find(|m| m.id == message.id) {
                return Ok(existing.clone());
            }
            entry.push(message.clone());
        }

        // Denormalized session fields; absence of the session is tolerated.
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.message_count += 1;
            session.last_message = truncate_chars(&message.content, PREVIEW_MAX_CHARS);
            session.updated_at = Utc::now();
        }

        Ok(message)
    }

    async fn messages(&self, session_id: &str) -> StorageResult<Vec<Message>> {
        let mut messages = self
            .messages
            .get(session_id)
            .map(|m| m.clone())
            .unwrap_or_default();
        sort_by_timestamp(&mut messages);
        Ok(messages)
    }

    async fn list_sessions(&self, user_id: &str, limit: usize) -> StorageResult<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.clone())
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn search_sessions(&self, user_id: &str, query: &str) -> StorageResult<Vec<Session>> {
        let sessions = self.list_sessions(user_id, usize::MAX).await?;
        if query.is_empty() {
            return Ok(sessions);
        }

        let needle = query.to_lowercase();
        Ok(sessions
            .into_iter()
            .filter(|s| {
                s.title.to_lowercase().contains(&needle)
                    || s.last_message.to_lowercase().contains(&needle)
            })
            .collect())
    }

    async fn delete_session(&self, session_id: &str) -> StorageResult<()> {
        // Messages go first so a cascaded read never observes orphans.
        self.messages.remove(session_id);
        self.sessions.remove(session_id);
        Ok(())
    }

    async fn update_session_title(
        &self,
        session_id: &str,
        title: &str,
    ) -> StorageResult<Session> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StorageError::NotFound(session_id.to_string()))?;
        session.title = title.to_string();
        session.updated_at = Utc::now();
        Ok(session.clone())
    }

    async fn session_stats(&self, session_id: &str) -> StorageResult<SessionStats> {
        let messages = self.messages(session_id).await?;
        Ok(SessionStats::compute(&messages))
    }
}
