//! Scripted adapter for tests — replays canned replies without a network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::adapter::{BackendAdapter, StreamEvent, StreamHandle};
use super::errors::InferenceError;
use super::types::{ChatRequest, Message, ToolCall};

/// Fragment size used when replaying text, to exercise chunk boundaries.
const FRAGMENT_CHARS: usize = 3;

/// One canned reply.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Plain text reply, streamed in small fragments.
    Text(String),
    /// Text plus natively decoded tool calls.
    NativeCalls(String, Vec<ToolCall>),
    /// The request is rejected before streaming starts.
    HttpError(u16, String),
    /// Streaming starts, then fails with a provider error.
    StreamFailure(String),
}

pub struct ScriptedAdapter {
    name: String,
    script: Mutex<VecDeque<Scripted>>,
    fallback: Option<Scripted>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedAdapter {
    pub fn new(name: &str, script: Vec<Scripted>) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            fallback: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// An adapter that answers every request with the same reply.
    pub fn repeating(name: &str, reply: Scripted) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::new(name, Vec::new())
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

fn fragments(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(FRAGMENT_CHARS)
        .map(|c| c.iter().collect())
        .collect()
}

#[async_trait]
impl BackendAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, request: ChatRequest) -> Result<StreamHandle, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.fallback.clone());

        let events = match next {
            None => {
                return Err(InferenceError::StreamError {
                    reason: format!("{}: script exhausted", self.name),
                })
            }
            Some(Scripted::HttpError(status, body)) => {
                return Err(InferenceError::HttpError { status, body })
            }
            Some(Scripted::Text(text)) => {
                let mut events: Vec<StreamEvent> =
                    fragments(&text).into_iter().map(StreamEvent::Chunk).collect();
                events.push(StreamEvent::Complete(Message::assistant(text)));
                events
            }
            Some(Scripted::NativeCalls(text, calls)) => {
                let mut events: Vec<StreamEvent> =
                    fragments(&text).into_iter().map(StreamEvent::Chunk).collect();
                events.extend(calls.iter().cloned().map(StreamEvent::ToolCall));
                events.push(StreamEvent::Complete(Message::assistant_with_calls(text, calls)));
                events
            }
            Some(Scripted::StreamFailure(message)) => vec![
                StreamEvent::Chunk("partial".into()),
                StreamEvent::Error(InferenceError::ProviderError { message }),
            ],
        };

        Ok(StreamHandle::from_events(events))
    }
}
