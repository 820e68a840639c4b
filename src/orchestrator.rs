//! Session orchestration.
//!
//! Composes the durable store, the remote API client, and the stream decoder
//! behind one ordered notification feed. Each session is a small state
//! machine (`idle → awaiting-response → idle`): while a send is in flight the
//! session is busy and a second send is rejected, never interleaved, so two
//! replies can never race into the same accumulator.
//!
//! Crash and interruption discipline:
//! - the user message is persisted BEFORE the network call;
//! - accumulated reply content is persisted when the stream ends, whether it
//!   ends naturally, by transport failure, or by cancellation — partial
//!   output is tagged incomplete instead of silently dropped;
//! - cancellation stops decoding and notification delivery but never touches
//!   already-committed data.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ChatApi, ChatEventStream, ChatStreamEvent, ClientError};
use crate::notify::{Notification, RenderSink};
use crate::store::{HistoryStore, StorageError};
use crate::store::types::{Message, Session, SessionStats, ToolInvocation};
use crate::title;

/// How many history entries to pull when syncing a session.
const HISTORY_SYNC_LIMIT: usize = 50;

/// Idle gap between stream events after which the response is abandoned.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A send is already in flight for this session.
    #[error("session {0} already has a send in flight")]
    Busy(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Coordinates user actions across store, network, and render sink.
///
/// Explicitly constructed with its collaborators injected; hold it in an
/// `Arc` and share freely, all methods take `&self`.
pub struct Orchestrator {
    store: Arc<dyn HistoryStore>,
    api: Arc<dyn ChatApi>,
    sink: RenderSink,
    user_id: String,
    /// Sessions with a send in flight; presence marks `awaiting-response`.
    in_flight: DashMap<String, CancellationToken>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        store: Arc<dyn HistoryStore>,
        api: Arc<dyn ChatApi>,
        sink: RenderSink,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            api,
            sink,
            user_id: user_id.into(),
            in_flight: DashMap::new(),
        }
    }

    /// Whether a send is currently in flight for the session.
    #[must_use]
    pub fn is_busy(&self, session_id: &str) -> bool {
        self.in_flight.contains_key(session_id)
    }

    // ------------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------------

    /// Create a session via the remote API, writing through to the store.
    ///
    /// When the network is unreachable a locally pending session is created
    /// instead (metadata `pending: true`), so the client stays usable offline.
    pub async fn create_session(&self) -> Result<Session, OrchestratorError> {
        let session = match self.api.create_session(&self.user_id, json!(null)).await {
            Ok(remote) => {
                let mut session = Session::with_id(remote.session_id, remote.user_id);
                if let Some(created_at) = remote.created_at {
                    session.created_at = created_at;
                    session.updated_at = remote.updated_at.unwrap_or(created_at);
                }
                if let Some(remote_title) = remote.title.filter(|t| !t.is_empty()) {
                    session.title = remote_title;
                }
                session
            }
            Err(ClientError::Network(e)) => {
                info!(error = %e, "session create unreachable, falling back to local pending session");
                let mut session = Session::new(&self.user_id);
                session.metadata.insert("pending".to_string(), json!(true));
                session
            }
            Err(e) => {
                self.emit(Notification::Error {
                    session_id: String::new(),
                    message: e.to_string(),
                });
                return Err(e.into());
            }
        };

        let session = self.store.put_session(session).await?;
        self.emit(Notification::SessionListChanged {
            session_id: session.id.clone(),
        });
        Ok(session)
    }

    /// Sessions of the configured user, most-recently-updated first.
    pub async fn sessions(&self, limit: usize) -> Result<Vec<Session>, OrchestratorError> {
        Ok(self.store.list_sessions(&self.user_id, limit).await?)
    }

    /// Search local history by title and preview.
    pub async fn search(&self, query: &str) -> Result<Vec<Session>, OrchestratorError> {
        Ok(self.store.search_sessions(&self.user_id, query).await?)
    }

    /// Messages of a session, in transcript order.
    pub async fn messages(&self, session_id: &str) -> Result<Vec<Message>, OrchestratorError> {
        Ok(self.store.messages(session_id).await?)
    }

    /// Derived statistics for a session.
    pub async fn session_stats(
        &self,
        session_id: &str,
    ) -> Result<SessionStats, OrchestratorError> {
        Ok(self.store.session_stats(session_id).await?)
    }

    /// Delete a session (cascading to its messages) and tell the sink.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), OrchestratorError> {
        self.store.delete_session(session_id).await?;
        self.emit(Notification::SessionListChanged {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// Pull remote history into the store, idempotently by message id.
    ///
    /// Offline, the cache manager serves the last good copy, so re-entering
    /// a conversation keeps working without the network.
    pub async fn sync_history(&self, session_id: &str) -> Result<usize, OrchestratorError> {
        let remote = self
            .api
            .message_history(session_id, HISTORY_SYNC_LIMIT, None)
            .await?;

        let merged = remote.len();
        for remote_message in remote {
            let message = remote_message.into_message(session_id);
            self.store.put_message(session_id, message).await?;
        }

        if merged > 0 {
            self.emit(Notification::SessionListChanged {
                session_id: session_id.to_string(),
            });
        }
        Ok(merged)
    }

    // ------------------------------------------------------------------------
    // Send / Cancel
    // ------------------------------------------------------------------------

    /// Send a user message and stream the assistant reply.
    ///
    /// Returns the persisted assistant message, or `None` when the stream
    /// produced nothing to persist. Rejected with `Busy` while another send
    /// for the same session is in flight.
    pub async fn send(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<Option<Message>, OrchestratorError> {
        let cancel = CancellationToken::new();
        match self.in_flight.entry(session_id.to_string()) {
            Entry::Occupied(_) => return Err(OrchestratorError::Busy(session_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
            }
        }
        let _flight = InFlightGuard {
            map: &self.in_flight,
            session_id,
        };

        // Persist the user turn before touching the network so it survives a
        // crash even if the call below never completes.
        let user_message = match self
            .store
            .put_message(session_id, Message::user(session_id, text))
            .await
        {
            Ok(message) => message,
            Err(e) => {
                self.emit_error(session_id, format!("failed to save message: {e}"));
                return Err(e.into());
            }
        };
        self.emit(Notification::MessageAppended {
            session_id: session_id.to_string(),
            message: user_message,
        });
        self.refresh_title(session_id).await;
        self.emit(Notification::SessionListChanged {
            session_id: session_id.to_string(),
        });

        let stream = match self.api.send_message(session_id, text, true).await {
            Ok(stream) => stream,
            Err(e) => {
                self.emit_error(session_id, format!("send failed: {e}"));
                return Err(e.into());
            }
        };

        let mut reply = Message::assistant(session_id, "");
        self.drive_stream(&mut reply, stream, &cancel).await;

        // Nothing accumulated at all: no empty assistant messages.
        if reply.content.is_empty() && reply.tool_calls.is_empty() {
            debug!(session_id = %session_id, "stream ended with nothing to persist");
            return Ok(None);
        }

        let reply = match self.store.put_message(session_id, reply).await {
            Ok(message) => message,
            Err(e) => {
                self.emit_error(session_id, format!("failed to save reply: {e}"));
                return Err(e.into());
            }
        };
        self.refresh_title(session_id).await;
        self.emit(Notification::MessageAppended {
            session_id: session_id.to_string(),
            message: reply.clone(),
        });
        self.emit(Notification::SessionListChanged {
            session_id: session_id.to_string(),
        });
        Ok(Some(reply))
    }

    /// Abort the in-flight send of a session.
    ///
    /// Decoding and notification delivery stop; content accumulated so far is
    /// persisted as incomplete by the send call being cancelled. Returns
    /// whether a send was actually in flight.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.in_flight.get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Fold decoded events into the reply until the stream ends, fails, or is
    /// cancelled. Notification order equals decode order.
    async fn drive_stream(
        &self,
        reply: &mut Message,
        stream: ChatEventStream,
        cancel: &CancellationToken,
    ) {
        let session_id = reply.session_id.clone();
        let mut stream = Box::pin(tokio_stream::StreamExt::timeout(
            stream,
            STREAM_IDLE_TIMEOUT,
        ));

        loop {
            let event = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(session_id = %session_id, "send cancelled, keeping accumulated content");
                    reply.incomplete = true;
                    return;
                }

                event = stream.next() => event,
            };

            // Flatten the idle-timeout layer: an elapsed timer ends the
            // stream like a transport failure.
            let event = event.map(|item| {
                item.unwrap_or_else(|_elapsed| {
                    Err(ClientError::StreamAborted("stream idle timeout".to_string()))
                })
            });

            match event {
                Some(Ok(ChatStreamEvent::ContentDelta { content })) => {
                    reply.content.push_str(&content);
                    self.emit(Notification::DeltaApplied {
                        session_id: session_id.clone(),
                        message_id: reply.id.clone(),
                        content,
                    });
                }

                Some(Ok(ChatStreamEvent::ToolCallStart {
                    tool_name,
                    parameters,
                })) => {
                    let invocation = ToolInvocation {
                        tool_name,
                        parameters,
                        result: None,
                    };
                    reply.tool_calls.push(invocation.clone());
                    self.emit(Notification::ToolEvent {
                        session_id: session_id.clone(),
                        message_id: reply.id.clone(),
                        invocation,
                    });
                }

                Some(Ok(ChatStreamEvent::ToolCallEnd {
                    tool_name,
                    parameters,
                    result,
                })) => {
                    let invocation = ToolInvocation {
                        tool_name: tool_name.clone(),
                        parameters,
                        result: Some(result),
                    };
                    // Complete the most recent still-open invocation of this
                    // tool; a stray end event just appends.
                    match reply
                        .tool_calls
                        .iter_mut()
                        .rev()
                        .find(|t| t.tool_name == tool_name && t.result.is_none())
                    {
                        Some(open) => *open = invocation.clone(),
                        None => reply.tool_calls.push(invocation.clone()),
                    }
                    self.emit(Notification::ToolEvent {
                        session_id: session_id.clone(),
                        message_id: reply.id.clone(),
                        invocation,
                    });
                }

                Some(Ok(ChatStreamEvent::Error { error })) => {
                    // Keep everything accumulated so far and make the failure
                    // visible in the transcript itself.
                    reply.content.push_str(&format!("\n❌ 错误: {error}"));
                    self.emit_error(&session_id, error);
                }

                Some(Err(e)) => {
                    warn!(session_id = %session_id, error = %e, "stream aborted");
                    reply.incomplete = true;
                    self.emit_error(&session_id, e.to_string());
                    return;
                }

                None => return,
            }
        }
    }

    /// Re-derive the session title while it is still the placeholder.
    async fn refresh_title(&self, session_id: &str) {
        let result: Result<(), StorageError> = async {
            let Some(session) = self.store.get_session(session_id).await? else {
                return Ok(());
            };
            if !session.title.is_empty() && session.title != title::DEFAULT_TITLE {
                return Ok(());
            }
            let messages = self.store.messages(session_id).await?;
            let derived = title::derive_title(&messages);
            if derived != session.title {
                self.store.update_session_title(session_id, &derived).await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!(session_id = %session_id, error = %e, "failed to refresh session title");
        }
    }

    fn emit(&self, notification: Notification) {
        if self.sink.send(notification).is_err() {
            debug!("render sink closed, dropping notification");
        }
    }

    fn emit_error(&self, session_id: &str, message: impl Into<String>) {
        self.emit(Notification::Error {
            session_id: session_id.to_string(),
            message: message.into(),
        });
    }
}

/// Marks the session idle again when the send completes or unwinds.
struct InFlightGuard<'a> {
    map: &'a DashMap<String, CancellationToken>,
    session_id: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(self.session_id);
    }
}
