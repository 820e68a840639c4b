//! Common test utilities.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use durachat::client::{
    ChatApi, ChatEventStream, ChatStreamEvent, ClientError, RemoteMessage, RemoteSession,
    SessionPage,
};
use durachat::notify::{self, Notification, RenderFeed};
use durachat::orchestrator::Orchestrator;
use durachat::store::{HistoryStore, MemoryHistoryStore, Role};

pub const TEST_USER: &str = "user-test";

/// Scripted stand-in for the remote chat API.
///
/// Queued event streams are handed out to `send_message` calls in order; the
/// `offline` switch makes every call fail with a network error.
#[derive(Default)]
pub struct FakeChatApi {
    streams: Mutex<VecDeque<ChatEventStream>>,
    offline: AtomicBool,
    history: Mutex<Vec<RemoteMessage>>,
}

impl FakeChatApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a stream that yields these events and then ends.
    pub fn queue_events(&self, events: Vec<ChatStreamEvent>) {
        self.queue_results(events.into_iter().map(Ok).collect());
    }

    /// Queue a stream of raw results (for scripting mid-stream failures).
    pub fn queue_results(&self, results: Vec<Result<ChatStreamEvent, ClientError>>) {
        self.streams
            .lock()
            .unwrap()
            .push_back(Box::pin(futures::stream::iter(results)));
    }

    /// Queue a stream that yields these events and then hangs until dropped.
    pub fn queue_hanging(&self, events: Vec<ChatStreamEvent>) {
        let stream = futures::stream::iter(events.into_iter().map(Ok)).chain(
            futures::stream::pending::<Result<ChatStreamEvent, ClientError>>(),
        );
        self.streams.lock().unwrap().push_back(Box::pin(stream));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_history(&self, messages: Vec<RemoteMessage>) {
        *self.history.lock().unwrap() = messages;
    }

    fn check_online(&self) -> Result<(), ClientError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(ClientError::Network("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn create_session(
        &self,
        user_id: &str,
        _session_config: serde_json::Value,
    ) -> Result<RemoteSession, ClientError> {
        self.check_online()?;
        Ok(RemoteSession {
            session_id: "session_remote1".to_string(),
            user_id: user_id.to_string(),
            title: None,
            created_at: None,
            updated_at: None,
        })
    }

    async fn list_sessions(
        &self,
        _page: u32,
        _page_size: u32,
        _user_id: Option<&str>,
        _status: Option<&str>,
    ) -> Result<SessionPage, ClientError> {
        self.check_online()?;
        Ok(SessionPage::default())
    }

    async fn message_history(
        &self,
        _session_id: &str,
        _limit: usize,
        _role: Option<Role>,
    ) -> Result<Vec<RemoteMessage>, ClientError> {
        self.check_online()?;
        Ok(self.history.lock().unwrap().clone())
    }

    async fn send_message(
        &self,
        _session_id: &str,
        _message: &str,
        _tools_enabled: bool,
    ) -> Result<ChatEventStream, ClientError> {
        self.check_online()?;
        self.streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ClientError::StreamAborted("no scripted stream".to_string()))
    }
}

/// Orchestrator over a memory store and the fake API, plus handles to both.
pub fn setup() -> (
    Arc<Orchestrator>,
    Arc<FakeChatApi>,
    Arc<MemoryHistoryStore>,
    RenderFeed,
) {
    let api = Arc::new(FakeChatApi::new());
    let store = Arc::new(MemoryHistoryStore::new());
    let dyn_store: Arc<dyn HistoryStore> = store.clone();
    let dyn_api: Arc<dyn ChatApi> = api.clone();
    let (sink, feed) = notify::channel();
    let orchestrator = Arc::new(Orchestrator::new(dyn_store, dyn_api, sink, TEST_USER));
    (orchestrator, api, store, feed)
}

/// Receive the next notification, failing the test after a timeout.
pub async fn next_notification(feed: &mut RenderFeed) -> Notification {
    tokio::time::timeout(Duration::from_secs(5), feed.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("render feed closed")
}

/// Shorthand for a content delta event.
pub fn delta(content: &str) -> ChatStreamEvent {
    ChatStreamEvent::ContentDelta {
        content: content.to_string(),
    }
}
