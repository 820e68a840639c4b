//! Incremental Server-Sent Events framing.
//!
//! Turns an unbounded sequence of byte chunks into discrete SSE frames, in
//! arrival order, emitting each frame as soon as its terminating blank line
//! (or end of stream) arrives. Chunk boundaries are arbitrary: a line, and
//! even a single UTF-8 character, may straddle two chunks, so the decoder
//! buffers raw bytes and only converts complete lines.
//!
//! Each decoder instance starts from an empty buffer and holds no state
//! across stream sessions.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;

/// One assembled SSE frame.
///
/// `data` joins multiple `data:` lines with `\n`, per the SSE spec.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseFrame {
    fn is_empty(&self) -> bool {
        self.data.is_empty() && self.event.is_none() && self.id.is_none() && self.retry.is_none()
    }

    /// Fold one line into the frame under assembly.
    fn absorb(&mut self, line: &str) {
        if let Some(rest) = line.strip_prefix("data:") {
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(strip_field_space(rest));
        } else if let Some(rest) = line.strip_prefix("event:") {
            self.event = Some(strip_field_space(rest).to_string());
        } else if let Some(rest) = line.strip_prefix("id:") {
            self.id = Some(strip_field_space(rest).to_string());
        } else if let Some(rest) = line.strip_prefix("retry:") {
            if let Ok(ms) = strip_field_space(rest).trim().parse() {
                self.retry = Some(ms);
            }
        }
        // Comments (leading ':') and unknown fields are ignored.
    }
}

/// SSE allows exactly one optional space after the field colon.
fn strip_field_space(value: &str) -> &str {
    value.strip_prefix(' ').unwrap_or(value)
}

/// Stream adapter yielding one [`SseFrame`] per record in a byte stream.
pub struct SseDecoder<S> {
    inner: S,
    buffer: BytesMut,
    pending: SseFrame,
    done: bool,
}

impl<S> SseDecoder<S> {
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            pending: SseFrame::default(),
            done: false,
        }
    }

    /// Take the next complete line out of the buffer, handling `\n` and
    /// `\r\n` endings. Returns `None` while the trailing line is incomplete.
    fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line = self.buffer.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Flush whatever is buffered at end of stream: a final unterminated
    /// line is still absorbed, and a non-empty pending frame is emitted.
    fn flush(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let tail = self.buffer.split();
            let mut line = String::from_utf8_lossy(&tail).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            self.pending.absorb(&line);
        }
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

impl<S, E> Stream for SseDecoder<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<SseFrame, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        loop {
            // Drain complete lines before pulling more bytes.
            while let Some(line) = self.next_line() {
                if line.is_empty() {
                    if !self.pending.is_empty() {
                        return Poll::Ready(Some(Ok(std::mem::take(&mut self.pending))));
                    }
                } else if !line.starts_with(':') {
                    self.pending.absorb(&line);
                }
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.buffer.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    self.done = true;
                    return Poll::Ready(self.flush().map(Ok));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
