//! Text tool-call protocol — tool calling for backends that only produce text.
//!
//! [`TextToolProtocol`] wraps any adapter and:
//!
//! 1. moves the tool catalog out of the request and into the system prompt,
//! 2. re-renders history so the backend sees tool traffic as plain text,
//! 3. runs the reply through the tag scanner, forwarding prose as `Chunk`
//!    events and turning each `<ToolCall>` span into `ToolCall` events.
//!
//! The session above sees the same event contract as with a native backend.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use super::adapter::{BackendAdapter, StreamEvent, StreamHandle, StreamSender};
use super::errors::InferenceError;
use super::prompt::build_tool_system_prompt;
use super::scanner::{ScanEvent, TagScanner};
use super::tool_call_parser::ToolCallExtractor;
use super::types::{ChatRequest, Message, Role, ToolCall, ToolSpec};

// ─── Adapter Wrapper ─────────────────────────────────────────────────────────

/// Adapter decorator that speaks the `<ToolCall>` text protocol to `inner`.
pub struct TextToolProtocol<A> {
    inner: A,
}

impl<A: BackendAdapter> TextToolProtocol<A> {
    pub fn new(inner: A) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }
}

#[async_trait]
impl<A: BackendAdapter> BackendAdapter for TextToolProtocol<A> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send(&self, request: ChatRequest) -> Result<StreamHandle, InferenceError> {
        let messages =
            render_for_text_protocol(&inject_system_prompt(&request.messages, &request.tools));

        tracing::debug!(
            adapter = self.inner.name(),
            tool_count = request.tools.len(),
            message_count = messages.len(),
            "sending request with text tool protocol"
        );

        let handle = self
            .inner
            .send(ChatRequest {
                messages,
                tools: Vec::new(),
                params: request.params,
            })
            .await?;

        Ok(scan_tool_calls(handle))
    }
}

// ─── Request Rendering ───────────────────────────────────────────────────────

/// Put the tool catalog into the system prompt.
///
/// Merges into a leading system message when there is one, otherwise
/// prepends a new one. Without tools the messages are returned unchanged.
pub fn inject_system_prompt(messages: &[Message], tools: &[ToolSpec]) -> Vec<Message> {
    let catalog = build_tool_system_prompt(tools);
    let mut out = messages.to_vec();
    if catalog.is_empty() {
        return out;
    }

    match out.first_mut() {
        Some(first) if first.role == Role::System => {
            if !first.content.trim().is_empty() {
                first.content.push_str("\n\n");
            }
            first.content.push_str(&catalog);
        }
        _ => out.insert(0, Message::system(catalog)),
    }
    out
}

/// Rewrite history for a backend without native tool roles.
///
/// Assistant tool calls become `<ToolCall>` blocks appended to the reply text
/// (the form the model itself produced). Tool results become user messages
/// naming the call they answer.
pub fn render_for_text_protocol(messages: &[Message]) -> Vec<Message> {
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    let mut out = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::Assistant if msg.has_tool_calls() => {
                let mut content = msg.content.clone();
                for call in &msg.tool_calls {
                    call_names.insert(call.id.as_str(), call.name.as_str());
                    if !content.is_empty() && !content.ends_with('\n') {
                        content.push('\n');
                    }
                    content.push_str(&render_tool_call_tag(call));
                }
                out.push(Message::assistant(content));
            }
            Role::Tool => {
                let id = msg.tool_call_id.as_deref().unwrap_or("unknown");
                let header = match call_names.get(id) {
                    Some(name) => format!("Tool result for {name} ({id}):"),
                    None => format!("Tool result ({id}):"),
                };
                out.push(Message::user(format!("{header}\n{}", msg.content)));
            }
            _ => out.push(msg.clone()),
        }
    }

    out
}

/// Serialize a call in the tag format the system prompt asks for.
pub fn render_tool_call_tag(call: &ToolCall) -> String {
    let body = json!({
        "tool": call.name,
        "parameters": Value::Object(call.arguments.clone()),
    });
    format!("<ToolCall>{body}</ToolCall>")
}

// ─── Reply Scanning ──────────────────────────────────────────────────────────

/// Per-reply scanning state.
struct ReplyScan {
    scanner: TagScanner,
    extractor: ToolCallExtractor,
    content: String,
    calls: Vec<ToolCall>,
    /// Native calls as the inner adapter streamed them, before id admission.
    streamed_native: Vec<ToolCall>,
    saw_chunks: bool,
}

impl ReplyScan {
    fn new() -> Self {
        Self {
            scanner: TagScanner::new(),
            extractor: ToolCallExtractor::new(),
            content: String::new(),
            calls: Vec::new(),
            streamed_native: Vec::new(),
            saw_chunks: false,
        }
    }

    fn apply(&mut self, events: Vec<ScanEvent>, tx: &StreamSender) {
        for event in events {
            match event {
                ScanEvent::Content(text) => {
                    self.content.push_str(&text);
                    tx.chunk(text);
                }
                ScanEvent::ToolSpan(body) => {
                    for call in self.extractor.extract_span(&body) {
                        tracing::debug!(tool = %call.name, id = %call.id, "tool call extracted from text");
                        self.calls.push(call.clone());
                        tx.tool_call(call);
                    }
                }
            }
        }
    }

    fn add_native(&mut self, call: ToolCall, tx: &StreamSender) {
        self.streamed_native.push(call.clone());
        self.admit_native(call, tx);
    }

    fn admit_native(&mut self, call: ToolCall, tx: &StreamSender) {
        let call = self.extractor.admit(call);
        self.calls.push(call.clone());
        tx.tool_call(call);
    }

    fn complete(mut self, message: Message, tx: &StreamSender) {
        // A backend that never streamed delivers its text only here.
        if !self.saw_chunks && !message.content.is_empty() {
            let events = self.scanner.push(&message.content);
            self.apply(events, tx);
        }
        let scanner = std::mem::take(&mut self.scanner);
        self.apply(scanner.finish(), tx);

        // The final message repeats calls that were already streamed.
        for call in message.tool_calls {
            match self.streamed_native.iter().position(|c| *c == call) {
                Some(pos) => {
                    self.streamed_native.swap_remove(pos);
                }
                None => self.admit_native(call, tx),
            }
        }

        tx.complete(Message::assistant_with_calls(self.content.trim(), self.calls));
    }
}

/// Filter an adapter's event stream through the tag scanner and extractor.
///
/// Prose is forwarded as `Chunk` events as soon as it cannot be part of a
/// tag; each parsed span becomes `ToolCall` events. The final message carries
/// the trimmed prose and every call (text-embedded and native, in order).
pub fn scan_tool_calls(mut inner: StreamHandle) -> StreamHandle {
    let (tx, handle) = StreamHandle::channel();

    tokio::spawn(async move {
        let mut scan = ReplyScan::new();

        while let Some(event) = inner.next().await {
            match event {
                StreamEvent::Chunk(text) => {
                    scan.saw_chunks = true;
                    let events = scan.scanner.push(&text);
                    scan.apply(events, &tx);
                }
                StreamEvent::ToolCall(call) => scan.add_native(call, &tx),
                StreamEvent::Error(e) => {
                    tx.error(e);
                    return;
                }
                StreamEvent::Complete(message) => {
                    scan.complete(message, &tx);
                    return;
                }
            }

            if tx.is_closed() {
                tracing::debug!("consumer dropped text protocol stream");
                return;
            }
        }

        tx.error(InferenceError::StreamError {
            reason: "stream ended without a complete event".into(),
        });
    });

    handle
}

// ─── Tests ───────────────────────────────────────────────────────────────────
