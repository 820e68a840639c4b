//! Typed decoding of the chat response event stream.
//!
//! The remote API streams replies as SSE records of the form
//! `data: {"type":"content_delta","data":{"content":"..."}}`. This adapter
//! sits on top of [`SseDecoder`](crate::sse::SseDecoder) and yields one
//! [`ChatStreamEvent`] per valid record, in arrival order, as soon as the
//! record is complete.
//!
//! A record whose payload fails to parse is dropped with a warning; losing
//! one malformed delta must not lose the valid ones behind it. Transport
//! errors end the stream with [`ClientError::StreamAborted`].

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use tracing::warn;

use super::error::ClientError;
use crate::sse::SseDecoder;

/// One discrete event decoded from the live response stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChatStreamEvent {
    /// A chunk of assistant text.
    ContentDelta { content: String },
    /// The assistant started a tool call.
    ToolCallStart {
        tool_name: String,
        #[serde(default)]
        parameters: serde_json::Value,
    },
    /// A tool call finished with a result.
    ToolCallEnd {
        tool_name: String,
        #[serde(default)]
        parameters: serde_json::Value,
        #[serde(default)]
        result: serde_json::Value,
    },
    /// A recoverable error reported inside the stream.
    Error { error: String },
}

/// A boxed stream of chat events, as handed to the orchestrator.
pub type ChatEventStream =
    Pin<Box<dyn Stream<Item = Result<ChatStreamEvent, ClientError>> + Send>>;

/// Adapter from a raw byte stream to typed chat events.
pub struct ChatEventDecoder<S> {
    inner: SseDecoder<S>,
    done: bool,
}

impl<S> ChatEventDecoder<S> {
    #[must_use]
    pub fn new(bytes: S) -> Self {
        Self {
            inner: SseDecoder::new(bytes),
            done: false,
        }
    }
}

impl<S, E> Stream for ChatEventDecoder<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    type Item = Result<ChatStreamEvent, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    if frame.data.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ChatStreamEvent>(&frame.data) {
                        Ok(event) => return Poll::Ready(Some(Ok(event))),
                        Err(e) => {
                            // Drop the record, keep the stream alive.
                            warn!(data = %frame.data, error = %e, "dropping malformed stream record");
                        }
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(ClientError::StreamAborted(e.to_string()))));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn decode_chunks(
        chunks: Vec<&str>,
    ) -> ChatEventDecoder<impl Stream<Item = Result<Bytes, std::convert::Infallible>> + Unpin>
    {
        ChatEventDecoder::new(futures::stream::iter(
            chunks
                .into_iter()
                .map(|s| Ok(Bytes::from(s.as_bytes().to_vec())))
                .collect::<Vec<Result<Bytes, std::convert::Infallible>>>(),
        ))
    }

    async fn collect(chunks: Vec<&str>) -> Vec<ChatStreamEvent> {
        decode_chunks(chunks).map(|r| r.unwrap()).collect().await
    }

    #[tokio::test]
    async fn decodes_content_delta() {
        let events =
            collect(vec!["data: {\"type\":\"content_delta\",\"data\":{\"content\":\"hi\"}}\n"])
                .await;
        assert_eq!(
            events,
            vec![ChatStreamEvent::ContentDelta {
                content: "hi".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn split_chunks_decode_identically() {
        let raw = "data: {\"type\":\"content_delta\",\"data\":{\"content\":\"hi\"}}\n";
        let whole = collect(vec![raw]).await;

        for split in 1..raw.len() {
            let (a, b) = raw.split_at(split);
            let events = collect(vec![a, b]).await;
            assert_eq!(events, whole, "split at byte {split}");
        }
    }

    #[tokio::test]
    async fn decodes_tool_call_events() {
        let start = json!({
            "type": "tool_call_start",
            "data": {"tool_name": "lookup", "parameters": {"q": "manual"}}
        });
        let end = json!({
            "type": "tool_call_end",
            "data": {"tool_name": "lookup", "parameters": {"q": "manual"}, "result": {"hits": 2}}
        });
        let start_line = format!("data: {start}\n");
        let end_line = format!("data: {end}\n");
        let events = collect(vec![start_line.as_str(), end_line.as_str()]).await;

        assert_eq!(events.len(), 2);
        match &events[0] {
            ChatStreamEvent::ToolCallStart { tool_name, parameters } => {
                assert_eq!(tool_name, "lookup");
                assert_eq!(parameters["q"], "manual");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match &events[1] {
            ChatStreamEvent::ToolCallEnd { result, .. } => {
                assert_eq!(result["hits"], 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_record_is_dropped_not_fatal() {
        let events = collect(vec![
            "data: {not json}\n",
            "data: {\"type\":\"content_delta\",\"data\":{\"content\":\"still here\"}}\n",
        ])
        .await;

        assert_eq!(
            events,
            vec![ChatStreamEvent::ContentDelta {
                content: "still here".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn unknown_event_type_is_dropped() {
        let events = collect(vec![
            "data: {\"type\":\"heartbeat\",\"data\":{}}\n",
            "data: {\"type\":\"error\",\"data\":{\"error\":\"overloaded\"}}\n",
        ])
        .await;

        assert_eq!(
            events,
            vec![ChatStreamEvent::Error {
                error: "overloaded".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn arrival_order_is_preserved() {
        let events = collect(vec![
            "data: {\"type\":\"content_delta\",\"data\":{\"content\":\"a\"}}\n",
            "data: {\"type\":\"content_delta\",\"data\":{\"content\":\"b\"}}\n",
            "data: {\"type\":\"content_delta\",\"data\":{\"content\":\"c\"}}\n",
        ])
        .await;

        let contents: Vec<_> = events
            .iter()
            .map(|e| match e {
                ChatStreamEvent::ContentDelta { content } => content.as_str(),
                other => panic!("unexpected event: {other:?}"),
            })
            .collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn decoder_is_restartable() {
        let first = collect(vec!["data: {\"type\":\"content_delta\",\"data\":{\"content\":\"x\"}}\n"]).await;
        let second = collect(vec!["data: {\"type\":\"content_delta\",\"data\":{\"content\":\"x\"}}\n"]).await;
        assert_eq!(first, second);
    }
}
