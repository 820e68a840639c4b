//! Remote chat API client.
//!
//! Thin typed wrapper over the session endpoints. All GET requests are routed
//! through the [`ResourceCache`](crate::cache::ResourceCache) so history and
//! session lists keep working offline; POSTs (including the streaming send)
//! pass the cache by. The orchestrator depends on the `ChatApi` trait, not on
//! this HTTP implementation.

pub mod error;
pub mod stream;

pub use error::{ClientError, Result};
pub use stream::{ChatEventDecoder, ChatEventStream, ChatStreamEvent};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::ResourceCache;
use crate::store::types::{Message, Role, ToolInvocation};

// ============================================================================
// Wire Types
// ============================================================================

/// Response envelope used by every endpoint.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::Deserialize<'de>"))]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default)]
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

impl<T> ApiEnvelope<T> {
    /// Unwrap the payload or translate the envelope error.
    fn into_data(self) -> Result<T> {
        if self.success {
            self.data
                .ok_or_else(|| ClientError::decode("missing data in successful envelope"))
        } else {
            Err(ClientError::api(
                200,
                self.error.unwrap_or_else(|| "unknown api error".to_string()),
            ))
        }
    }
}

/// A session as the remote API reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSession {
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One page of remote sessions.
#[derive(Debug, Default, Deserialize)]
pub struct SessionPage {
    #[serde(default)]
    pub sessions: Vec<RemoteSession>,
    #[serde(default)]
    pub total: Option<u64>,
}

/// A message as the remote API reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteMessage {
    #[serde(default)]
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tool_calls: Vec<ToolInvocation>,
}

impl RemoteMessage {
    /// Convert into a store message for idempotent merging.
    #[must_use]
    pub fn into_message(self, session_id: &str) -> Message {
        let mut message = Message::new(session_id, self.role, self.content);
        if !self.id.is_empty() {
            message.id = self.id;
        }
        if let Some(timestamp) = self.timestamp {
            message.timestamp = timestamp;
        }
        message.tool_calls = self.tool_calls;
        message
    }
}

#[derive(Debug, Deserialize)]
struct MessageHistory {
    #[serde(default)]
    messages: Vec<RemoteMessage>,
}

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    user_id: &'a str,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    session_config: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    message: &'a str,
    stream: bool,
    tools_enabled: bool,
}

// ============================================================================
// ChatApi Trait
// ============================================================================

/// The remote chat service as the orchestrator sees it.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// `POST /sessions`.
    async fn create_session(
        &self,
        user_id: &str,
        session_config: serde_json::Value,
    ) -> Result<RemoteSession>;

    /// `GET /sessions` (paged, filterable), served network-first.
    async fn list_sessions(
        &self,
        page: u32,
        page_size: u32,
        user_id: Option<&str>,
        status: Option<&str>,
    ) -> Result<SessionPage>;

    /// `GET /sessions/{id}/messages`, served network-first with cache
    /// fallback.
    async fn message_history(
        &self,
        session_id: &str,
        limit: usize,
        role: Option<Role>,
    ) -> Result<Vec<RemoteMessage>>;

    /// `POST /sessions/{id}/messages` with `stream: true`; the response body
    /// drives the stream decoder.
    async fn send_message(
        &self,
        session_id: &str,
        message: &str,
        tools_enabled: bool,
    ) -> Result<ChatEventStream>;
}

// ============================================================================
// HTTP Implementation
// ============================================================================

/// `reqwest` + cache-backed implementation of [`ChatApi`].
pub struct HttpChatApi {
    http: reqwest::Client,
    cache: Arc<ResourceCache>,
    base_url: String,
}

impl HttpChatApi {
    #[must_use]
    pub fn new(http: reqwest::Client, cache: Arc<ResourceCache>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            cache,
            base_url: base_url.into(),
        }
    }

    /// Run a cached GET and decode the `{success, data}` envelope.
    async fn cached_get<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.cache.fetch("GET", url).await;
        if !response.is_success() {
            return Err(ClientError::api(
                response.status,
                String::from_utf8_lossy(&response.body).into_owned(),
            ));
        }

        let envelope: ApiEnvelope<T> =
            serde_json::from_slice(&response.body).map_err(ClientError::decode)?;
        envelope.into_data()
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn create_session(
        &self,
        user_id: &str,
        session_config: serde_json::Value,
    ) -> Result<RemoteSession> {
        let url = format!("{}/sessions", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&CreateSessionRequest {
                user_id,
                session_config,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::api(status, message));
        }

        let envelope: ApiEnvelope<RemoteSession> = response.json().await?;
        envelope.into_data()
    }

    async fn list_sessions(
        &self,
        page: u32,
        page_size: u32,
        user_id: Option<&str>,
        status: Option<&str>,
    ) -> Result<SessionPage> {
        let mut url = format!(
            "{}/sessions?page={}&page_size={}",
            self.base_url, page, page_size
        );
        if let Some(user_id) = user_id {
            url.push_str(&format!("&user_id={user_id}"));
        }
        if let Some(status) = status {
            url.push_str(&format!("&status={status}"));
        }
        self.cached_get(&url).await
    }

    async fn message_history(
        &self,
        session_id: &str,
        limit: usize,
        role: Option<Role>,
    ) -> Result<Vec<RemoteMessage>> {
        let mut url = format!(
            "{}/sessions/{}/messages?limit={}",
            self.base_url, session_id, limit
        );
        if let Some(role) = role {
            url.push_str(&format!("&role={role}"));
        }
        let history: MessageHistory = self.cached_get(&url).await?;
        Ok(history.messages)
    }

    async fn send_message(
        &self,
        session_id: &str,
        message: &str,
        tools_enabled: bool,
    ) -> Result<ChatEventStream> {
        let url = format!("{}/sessions/{}/messages", self.base_url, session_id);
        let response = self
            .http
            .post(&url)
            .json(&SendMessageRequest {
                message,
                stream: true,
                tools_enabled,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::api(status, message));
        }

        Ok(Box::pin(ChatEventDecoder::new(response.bytes_stream())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_success_unwraps_data() {
        let envelope: ApiEnvelope<u32> =
            serde_json::from_str(r#"{"success":true,"data":7}"#).unwrap();
        assert_eq!(envelope.into_data().unwrap(), 7);
    }

    #[test]
    fn envelope_failure_carries_error() {
        let envelope: ApiEnvelope<u32> =
            serde_json::from_str(r#"{"success":false,"error":"nope"}"#).unwrap();
        let err = envelope.into_data().unwrap_err();
        assert!(matches!(err, ClientError::Api { .. }));
    }

    #[test]
    fn remote_message_conversion_keeps_identity() {
        let remote: RemoteMessage = serde_json::from_str(
            r#"{"id":"msg_1","role":"assistant","content":"hi","timestamp":"2026-01-05T10:00:00Z"}"#,
        )
        .unwrap();
        let message = remote.into_message("session_9");

        assert_eq!(message.id, "msg_1");
        assert_eq!(message.session_id, "session_9");
        assert_eq!(message.role, Role::Assistant);
        assert!(message.tool_calls.is_empty());
    }

    #[test]
    fn remote_message_without_id_gets_one() {
        let remote: RemoteMessage =
            serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        let message = remote.into_message("session_9");
        assert!(message.id.starts_with("msg_"));
    }

    #[test]
    fn session_page_defaults_to_empty() {
        let page: SessionPage = serde_json::from_str(r#"{}"#).unwrap();
        assert!(page.sessions.is_empty());
        assert!(page.total.is_none());
    }
}
