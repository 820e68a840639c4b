//! File-based history storage.
//!
//! Directory structure:
//!
//! ```text
//! {data_dir}/
//!   {session_id}/
//!     session.yaml       # Atomic snapshot of the session record
//!     messages.jsonl     # Append-only message log
//!   {session_id}.deleted # Tombstone of an interrupted delete (swept on open)
//! ```
//!
//! An in-memory session index is rebuilt by scanning the data dir on open and
//! kept current on every write, so list/search never touch the disk. Message
//! logs are loaded lazily per session and cached. Per-session async locks
//! serialize writers; readers run concurrently.
//!
//! Deletion is two-phase: the session dir is renamed to `{id}.deleted` (the
//! mark, atomic) and then removed (the sweep). A crash between the phases
//! leaves a tombstone that `open` sweeps away, so callers never observe
//! messages without their session or vice versa.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::error::{StorageError, StorageResult};
use super::types::{Message, PREVIEW_MAX_CHARS, Session, SessionStats, sort_by_timestamp};
use super::HistoryStore;
use crate::title::truncate_chars;

const SESSION_FILE: &str = "session.yaml";
const MESSAGES_FILE: &str = "messages.jsonl";
const TOMBSTONE_SUFFIX: &str = ".deleted";

/// Durable `HistoryStore` implementation over a local data directory.
pub struct FileHistoryStore {
    data_dir: PathBuf,
    index: DashMap<String, Session>,
    messages: DashMap<String, Vec<Message>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileHistoryStore {
    /// Open a store rooted at `data_dir`, creating it when missing.
    ///
    /// Sweeps tombstones left by interrupted deletes, then rebuilds the
    /// session index from the surviving snapshots. Unreadable session dirs
    /// are skipped with a warning rather than failing the whole open.
    pub async fn open(data_dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| StorageError::io(&data_dir, e))?;

        let store = Self {
            data_dir,
            index: DashMap::new(),
            messages: DashMap::new(),
            locks: DashMap::new(),
        };
        store.sweep_tombstones().await?;
        store.rebuild_index().await?;
        Ok(store)
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.data_dir.join(session_id)
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(SESSION_FILE)
    }

    fn messages_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(MESSAGES_FILE)
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Remove tombstones from interrupted deletes. Idempotent.
    async fn sweep_tombstones(&self) -> StorageResult<()> {
        let mut entries = fs::read_dir(&self.data_dir)
            .await
            .map_err(|e| StorageError::io(&self.data_dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&self.data_dir, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(TOMBSTONE_SUFFIX) {
                debug!(tombstone = %name, "sweeping interrupted delete");
                if let Err(e) = fs::remove_dir_all(entry.path()).await {
                    warn!(tombstone = %name, error = %e, "failed to sweep tombstone");
                }
            }
        }
        Ok(())
    }

    /// Scan session dirs and load their snapshots into the index.
    async fn rebuild_index(&self) -> StorageResult<()> {
        let mut entries = fs::read_dir(&self.data_dir)
            .await
            .map_err(|e| StorageError::io(&self.data_dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&self.data_dir, e))?
        {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let snapshot = path.join(SESSION_FILE);
            let contents = match fs::read_to_string(&snapshot).await {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::io(&snapshot, e)),
            };

            match serde_yaml::from_str::<Session>(&contents) {
                Ok(session) => {
                    self.index.insert(session.id.clone(), session);
                }
                Err(e) => {
                    warn!(path = %snapshot.display(), error = %e, "skipping unreadable session snapshot");
                }
            }
        }
        Ok(())
    }

    /// Write a session snapshot atomically (temp file + rename) and refresh
    /// the index. Caller must hold the session lock.
    async fn write_snapshot(&self, session: &Session) -> StorageResult<()> {
        let dir = self.session_dir(&session.id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;

        let final_path = self.session_path(&session.id);
        let temp_path = dir.join(format!("{SESSION_FILE}.tmp"));

        let yaml = serde_yaml::to_string(session).map_err(StorageError::serialization)?;
        fs::write(&temp_path, yaml.as_bytes())
            .await
            .map_err(|e| StorageError::io(&temp_path, e))?;
        fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| StorageError::io(&final_path, e))?;

        self.index.insert(session.id.clone(), session.clone());
        Ok(())
    }

    /// Load a session's messages, caching them. Malformed or truncated JSONL
    /// lines (crash artifacts) are skipped; duplicate ids collapse to the
    /// first occurrence.
    async fn load_messages(&self, session_id: &str) -> StorageResult<Vec<Message>> {
        if let Some(cached) = self.messages.get(session_id) {
            return Ok(cached.clone());
        }

        let path = self.messages_path(session_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(StorageError::io(&path, e)),
        };

        let mut loaded: Vec<Message> = Vec::new();
        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(trimmed) {
                Ok(message) => {
                    if !loaded.iter().any(|m| m.id == message.id) {
                        loaded.push(message);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed message line");
                }
            }
        }
        sort_by_timestamp(&mut loaded);

        self.messages.insert(session_id.to_string(), loaded.clone());
        Ok(loaded)
    }

    /// Append one message to the session's JSONL log. Caller must hold the
    /// session lock.
    async fn append_message(&self, session_id: &str, message: &Message) -> StorageResult<()> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;

        let path = self.messages_path(session_id);
        let mut line = serde_json::to_string(message).map_err(StorageError::serialization)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.flush().await.map_err(|e| StorageError::io(&path, e))?;
        Ok(())
    }

    async fn remove_dir_if_exists(path: &Path) -> StorageResult<()> {
        match fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn put_session(&self, session: Session) -> StorageResult<Session> {
        let lock = self.lock_for(&session.id);
        let _guard = lock.lock().await;

        self.write_snapshot(&session).await?;
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> StorageResult<Option<Session>> {
        Ok(self.index.get(session_id).map(|s| s.clone()))
    }

    async fn put_message(&self, session_id: &str, mut message: Message) -> StorageResult<Message> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        if message.id.is_empty() {
            message.id = super::generate_message_id();
        }
        message.session_id = session_id.to_string();

        let existing = self.load_messages(session_id).await?;
        if let Some(found) = existing.iter().find(|m| m.id == message.id) {
            return Ok(found.clone());
        }

        self.append_message(session_id, &message).await?;
        self.messages
            .entry(session_id.to_string())
            .or_default()
            .push(message.clone());

        if let Some(mut session) = self.index.get(session_id).map(|s| s.clone()) {
            session.message_count += 1;
            session.last_message = truncate_chars(&message.content, PREVIEW_MAX_CHARS);
            session.updated_at = Utc::now();
            self.write_snapshot(&session).await?;
        }

        Ok(message)
    }

    async fn messages(&self, session_id: &str) -> StorageResult<Vec<Message>> {
        self.load_messages(session_id).await
    }

    async fn list_sessions(&self, user_id: &str, limit: usize) -> StorageResult<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .index
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
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        self.index.remove(session_id);
        self.messages.remove(session_id);

        let dir = self.session_dir(session_id);
        if fs::metadata(&dir).await.is_err() {
            return Ok(());
        }

        // Phase 1: mark. The rename is atomic, so the session (and all its
        // messages with it) disappears in one step.
        let tombstone = self
            .data_dir
            .join(format!("{session_id}{TOMBSTONE_SUFFIX}"));
        Self::remove_dir_if_exists(&tombstone).await?;
        fs::rename(&dir, &tombstone)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;

        // Phase 2: sweep. A crash before this point is repaired on next open.
        Self::remove_dir_if_exists(&tombstone).await?;
        Ok(())
    }

    async fn update_session_title(
        &self,
        session_id: &str,
        title: &str,
    ) -> StorageResult<Session> {
        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let mut session = self
            .index
            .get(session_id)
            .map(|s| s.clone())
            .ok_or_else(|| StorageError::NotFound(session_id.to_string()))?;
        session.title = title.to_string();
        session.updated_at = Utc::now();
        self.write_snapshot(&session).await?;
        Ok(session)
    }

    async fn session_stats(&self, session_id: &str) -> StorageResult<SessionStats> {
        let messages = self.load_messages(session_id).await?;
        Ok(SessionStats::compute(&messages))
    }
}
