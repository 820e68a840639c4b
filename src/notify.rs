//! Ordered notifications for the render sink.
//!
//! The orchestrator emits one notification per meaningful state change, in
//! exactly the order the underlying events were decoded. Delivery goes over
//! an unbounded channel so a slow consumer can never stall the engine.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::store::types::{Message, ToolInvocation};

/// A state-change notification delivered to the render sink.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
    /// The session list (ordering, titles, previews) changed.
    SessionListChanged { session_id: String },
    /// A message was persisted to the session.
    MessageAppended {
        session_id: String,
        message: Message,
    },
    /// A content delta was folded into the in-progress reply.
    DeltaApplied {
        session_id: String,
        message_id: String,
        content: String,
    },
    /// A tool invocation started or completed on the in-progress reply.
    ToolEvent {
        session_id: String,
        message_id: String,
        invocation: ToolInvocation,
    },
    /// A user-visible error (send failed, stream aborted, ...).
    Error {
        session_id: String,
        message: String,
    },
}

impl Notification {
    /// The session this notification belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Notification::SessionListChanged { session_id }
            | Notification::MessageAppended { session_id, .. }
            | Notification::DeltaApplied { session_id, .. }
            | Notification::ToolEvent { session_id, .. }
            | Notification::Error { session_id, .. } => session_id,
        }
    }
}

/// Sending half handed to the orchestrator.
pub type RenderSink = mpsc::UnboundedSender<Notification>;

/// Receiving half owned by the render layer.
pub type RenderFeed = mpsc::UnboundedReceiver<Notification>;

/// Create a render sink/feed pair.
#[must_use]
pub fn channel() -> (RenderSink, RenderFeed) {
    mpsc::unbounded_channel()
}
