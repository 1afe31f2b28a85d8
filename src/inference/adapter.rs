//! Backend adapter contract.
//!
//! A `BackendAdapter` performs one request against one provider and hands back
//! a `StreamHandle`. The handle is both a `Stream` of `StreamEvent`s and,
//! through [`StreamHandle::into_message`], a promise of the final `Message`.
//!
//! Event ordering for one request: zero or more `Chunk`, zero or more native
//! `ToolCall`, then exactly one terminal event — `Complete` on success or
//! `Error` on failure. Nothing is sent after the terminal event.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::errors::InferenceError;
use super::types::{ChatRequest, Message, ToolCall};

// ─── Events ──────────────────────────────────────────────────────────────────

/// One event emitted by an adapter during a single request.
#[derive(Debug)]
pub enum StreamEvent {
    /// Visible reply text.
    Chunk(String),
    /// A tool call decoded by the adapter itself (native tool calling).
    ToolCall(ToolCall),
    /// Terminal failure.
    Error(InferenceError),
    /// Terminal success with the final assembled message.
    Complete(Message),
}

// ─── Adapter Trait ───────────────────────────────────────────────────────────

/// Translates a provider-neutral `ChatRequest` into one provider call.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Short identifier used in logs (e.g. the configured service name).
    fn name(&self) -> &str;

    /// Start a request.
    ///
    /// Errors detected before any event is produced (connection refused,
    /// non-2xx status) are returned directly; later failures arrive as a
    /// terminal `StreamEvent::Error`.
    async fn send(&self, request: ChatRequest) -> Result<StreamHandle, InferenceError>;
}

// ─── Stream Handle ───────────────────────────────────────────────────────────

/// Receiving side of one request's event stream.
///
/// Dropping the handle detaches the consumer; the producer's remaining sends
/// are discarded.
pub struct StreamHandle {
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

/// Producing side of one request's event stream.
#[derive(Clone)]
pub struct StreamSender {
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamHandle {
    /// Create a connected sender/handle pair.
    pub fn channel() -> (StreamSender, StreamHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamSender { events: tx }, StreamHandle { events: rx })
    }

    /// Build a handle that replays a fixed event sequence.
    pub fn from_events(events: impl IntoIterator<Item = StreamEvent>) -> Self {
        let (tx, handle) = Self::channel();
        for event in events {
            tx.send(event);
        }
        handle
    }

    /// Drain the stream, calling `on_event` for every event including the
    /// terminal `Complete` or `Error`, and resolve to the final message.
    ///
    /// The listener only lives for the duration of this call.
    pub async fn finish<F>(mut self, mut on_event: F) -> Result<Message, InferenceError>
    where
        F: FnMut(&StreamEvent),
    {
        while let Some(event) = self.next().await {
            on_event(&event);
            match event {
                StreamEvent::Complete(message) => return Ok(message),
                StreamEvent::Error(e) => return Err(e),
                StreamEvent::Chunk(_) | StreamEvent::ToolCall(_) => {}
            }
        }

        Err(InferenceError::StreamError {
            reason: "stream ended without a complete event".into(),
        })
    }

    /// Await the final message, discarding intermediate events.
    pub async fn into_message(self) -> Result<Message, InferenceError> {
        self.finish(|_| {}).await
    }
}

impl Stream for StreamHandle {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl StreamSender {
    /// Push an event. Returns `false` once the consumer has gone away.
    pub fn send(&self, event: StreamEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn chunk(&self, text: impl Into<String>) -> bool {
        self.send(StreamEvent::Chunk(text.into()))
    }

    pub fn tool_call(&self, call: ToolCall) -> bool {
        self.send(StreamEvent::ToolCall(call))
    }

    pub fn error(&self, error: InferenceError) -> bool {
        self.send(StreamEvent::Error(error))
    }

    pub fn complete(&self, message: Message) -> bool {
        self.send(StreamEvent::Complete(message))
    }

    /// Whether the consumer dropped its handle.
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finish_forwards_chunks_and_returns_message() {
        let handle = StreamHandle::from_events(vec![
            StreamEvent::Chunk("Hel".into()),
            StreamEvent::Chunk("lo".into()),
            StreamEvent::Complete(Message::assistant("Hello")),
        ]);

        let mut seen = String::new();
        let msg = handle
            .finish(|event| {
                if let StreamEvent::Chunk(text) = event {
                    seen.push_str(text);
                }
            })
            .await
            .unwrap();

        assert_eq!(seen, "Hello");
        assert_eq!(msg.content, "Hello");
    }

    #[tokio::test]
    async fn test_error_event_rejects() {
        let handle = StreamHandle::from_events(vec![
            StreamEvent::Chunk("partial".into()),
            StreamEvent::Error(InferenceError::StreamError {
                reason: "connection reset".into(),
            }),
        ]);

        let mut errors_seen = 0;
        let err = handle
            .finish(|event| {
                if let StreamEvent::Error(e) = event {
                    assert!(e.to_string().contains("connection reset"));
                    errors_seen += 1;
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::StreamError { .. }));
        assert_eq!(errors_seen, 1, "listener sees the terminal error");
    }

    #[tokio::test]
    async fn test_stream_without_terminal_event_is_an_error() {
        let handle = StreamHandle::from_events(vec![StreamEvent::Chunk("dangling".into())]);
        let err = handle.into_message().await.unwrap_err();
        assert!(err.to_string().contains("without a complete event"));
    }

    #[tokio::test]
    async fn test_sender_reports_closed_consumer() {
        let (tx, handle) = StreamHandle::channel();
        assert!(tx.chunk("a"));
        drop(handle);
        assert!(tx.is_closed());
        assert!(!tx.chunk("b"));
    }
}
