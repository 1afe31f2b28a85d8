//! SSE streaming response parser for OpenAI-compatible chat completions.
//!
//! Reads a `reqwest::Response` as a byte stream, splits on SSE boundaries
//! (`data: …\n\n`), parses each chunk as JSON, and accumulates native tool
//! calls across multiple deltas.

use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use super::errors::InferenceError;
use super::tool_call_parser::parse_native_json_tool_call;
use super::types::{ChatCompletionChunk, StreamChunk, ToolCall};

// ─── SSE line parser ─────────────────────────────────────────────────────────

/// Parse an SSE HTTP response into `StreamChunk`s.
///
/// This is the main entry point for streaming. It:
/// 1. Splits the HTTP body into SSE events
/// 2. Parses each `data:` line as a `ChatCompletionChunk`
/// 3. Accumulates tool call fragments across deltas
/// 4. Emits complete `StreamChunk`s for each event
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<StreamChunk, InferenceError>> {
    parse_sse_bytes(response.bytes_stream())
}

/// Parse a stream of raw body reads into `StreamChunk`s.
///
/// Reads are buffered as bytes and only complete events are decoded, so a
/// multi-byte character or a `\r\n` split across reads survives intact.
pub fn parse_sse_bytes<S, B, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<StreamChunk, InferenceError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let state = StreamState::new();

    stream::unfold(
        (Box::pin(byte_stream), state, Vec::<u8>::new()),
        |(mut byte_stream, mut state, mut buffer)| async move {
            loop {
                if let Some(event) = take_event(&mut buffer) {
                    match state.process_event(&event) {
                        Ok(Some(chunk)) => return Some((Ok(chunk), (byte_stream, state, buffer))),
                        Ok(None) => continue, // [DONE] or keep-alive
                        Err(e) => return Some((Err(e), (byte_stream, state, buffer))),
                    }
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => append_normalized(&mut buffer, bytes.as_ref()),
                    Some(Err(e)) => {
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, state, buffer),
                        ));
                    }
                    None => {
                        // Stream ended: flush a trailing event without a blank line,
                        // then any native calls that never saw a finish_reason.
                        let tail = String::from_utf8_lossy(&std::mem::take(&mut buffer)).into_owned();
                        if !tail.trim().is_empty() {
                            match state.process_event(tail.trim()) {
                                Ok(Some(chunk)) => {
                                    return Some((Ok(chunk), (byte_stream, state, buffer)))
                                }
                                Ok(None) => {}
                                Err(e) => return Some((Err(e), (byte_stream, state, buffer))),
                            }
                        }
                        return state
                            .finalize()
                            .map(|chunk| (Ok(chunk), (byte_stream, state, buffer)));
                    }
                }
            }
        },
    )
}

/// Append a read to the event buffer, folding `\r\n` into `\n`.
fn append_normalized(buffer: &mut Vec<u8>, bytes: &[u8]) {
    buffer.reserve(bytes.len());
    for &b in bytes {
        if b == b'\n' && buffer.last() == Some(&b'\r') {
            buffer.pop();
        }
        buffer.push(b);
    }
}

/// Remove and decode the first complete event (terminated by a blank line).
fn take_event(buffer: &mut Vec<u8>) -> Option<String> {
    let end = buffer.windows(2).position(|w| w == b"\n\n")?;
    let event = String::from_utf8_lossy(&buffer[..end]).into_owned();
    buffer.drain(..end + 2);
    Some(event)
}

// ─── Stream State ────────────────────────────────────────────────────────────

/// Mutable state for accumulating tool call fragments across SSE events.
struct StreamState {
    /// In-progress native tool calls: `(index, id, name, arguments_buffer)`.
    pending_tool_calls: Vec<(u32, Option<String>, String, String)>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            pending_tool_calls: Vec::new(),
        }
    }

    /// Process a single SSE event string (may contain multiple `data:` lines).
    fn process_event(&mut self, event: &str) -> Result<Option<StreamChunk>, InferenceError> {
        let mut data_content = String::new();

        for line in event.lines() {
            if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
                let data = data.trim();
                if data == "[DONE]" {
                    return Ok(self.finalize());
                }
                data_content.push_str(data);
            }
            // Ignore non-data lines (comments, event types, etc.)
        }

        if data_content.is_empty() {
            return Ok(None); // Keep-alive or comment
        }

        let chunk: ChatCompletionChunk =
            serde_json::from_str(&data_content).map_err(|e| InferenceError::StreamError {
                reason: format!("failed to parse SSE chunk: {e} (data: {data_content})"),
            })?;

        self.process_chunk(chunk)
    }

    /// Process a parsed `ChatCompletionChunk`.
    fn process_chunk(
        &mut self,
        chunk: ChatCompletionChunk,
    ) -> Result<Option<StreamChunk>, InferenceError> {
        if let Some(error) = chunk.error {
            return Err(InferenceError::ProviderError {
                message: provider_error_message(&error),
            });
        }

        let choice = match chunk.choices.first() {
            Some(c) => c,
            None => return Ok(None),
        };

        let mut result = StreamChunk {
            token: None,
            tool_calls: None,
            finish_reason: choice.finish_reason.clone(),
        };

        // Only `content` is surfaced; reasoning deltas are not part of the reply.
        if let Some(ref content) = choice.delta.content {
            if !content.is_empty() {
                result.token = Some(content.clone());
            }
        }

        if let Some(ref tool_calls) = choice.delta.tool_calls {
            for tc in tool_calls {
                let index = tc.index.unwrap_or(0);

                let pending = self
                    .pending_tool_calls
                    .iter_mut()
                    .find(|(idx, _, _, _)| *idx == index);

                match pending {
                    Some((_, ref mut id, ref mut name, ref mut args)) => {
                        if let Some(ref f) = tc.function {
                            if let Some(ref n) = f.name {
                                name.push_str(n);
                            }
                            if let Some(ref a) = f.arguments {
                                args.push_str(a);
                            }
                        }
                        if tc.id.is_some() {
                            *id = tc.id.clone();
                        }
                    }
                    None => {
                        let name = tc
                            .function
                            .as_ref()
                            .and_then(|f| f.name.clone())
                            .unwrap_or_default();
                        let args = tc
                            .function
                            .as_ref()
                            .and_then(|f| f.arguments.clone())
                            .unwrap_or_default();
                        self.pending_tool_calls
                            .push((index, tc.id.clone(), name, args));
                    }
                }
            }
        }

        if result.finish_reason.as_deref() == Some("tool_calls") {
            let calls = self.finalize_native_tool_calls();
            if !calls.is_empty() {
                result.tool_calls = Some(calls);
            }
        }

        Ok(Some(result))
    }

    /// Finalize accumulated native tool calls. Calls that fail to parse are
    /// logged and dropped.
    fn finalize_native_tool_calls(&mut self) -> Vec<ToolCall> {
        let pending = std::mem::take(&mut self.pending_tool_calls);
        let mut calls = Vec::with_capacity(pending.len());

        for (index, id, name, args) in pending {
            match parse_native_json_tool_call(id.as_deref(), &name, &args) {
                Ok(call) => calls.push(call),
                Err(e) => tracing::warn!(index, tool = %name, error = %e, "dropping malformed native tool call"),
            }
        }

        calls
    }

    /// Emit any native calls still pending at end of stream.
    fn finalize(&mut self) -> Option<StreamChunk> {
        if self.pending_tool_calls.is_empty() {
            return None;
        }
        let calls = self.finalize_native_tool_calls();
        Some(StreamChunk {
            token: None,
            tool_calls: (!calls.is_empty()).then_some(calls),
            finish_reason: Some("tool_calls".into()),
        })
    }
}

/// Best-effort message from a provider `error` object (`{"message": …}` or a string).
fn provider_error_message(error: &serde_json::Value) -> String {
    error
        .get("message")
        .and_then(serde_json::Value::as_str)
        .or_else(|| error.as_str())
        .map(String::from)
        .unwrap_or_else(|| error.to_string())
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Parse a non-streaming response body into content and native tool calls.
///
/// Used for services configured with `streaming: false`.
pub fn parse_non_streaming_response(body: &str) -> Result<StreamChunk, InferenceError> {
    #[derive(Deserialize)]
    struct NonStreamResponse {
        #[serde(default)]
        choices: Vec<NonStreamChoice>,
        #[serde(default)]
        error: Option<serde_json::Value>,
    }

    #[derive(Deserialize)]
    struct NonStreamChoice {
        message: NonStreamMessage,
        finish_reason: Option<String>,
    }

    #[derive(Deserialize)]
    struct NonStreamMessage {
        content: Option<String>,
        tool_calls: Option<Vec<NonStreamToolCall>>,
    }

    #[derive(Deserialize)]
    struct NonStreamToolCall {
        id: Option<String>,
        function: NonStreamFunction,
    }

    #[derive(Deserialize)]
    struct NonStreamFunction {
        name: String,
        #[serde(default)]
        arguments: String,
    }

    let resp: NonStreamResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse non-streaming response: {e}"),
        })?;

    if let Some(error) = resp.error {
        return Err(InferenceError::ProviderError {
            message: provider_error_message(&error),
        });
    }

    let choice = resp.choices.first().ok_or(InferenceError::StreamError {
        reason: "empty choices array".into(),
    })?;

    let content = choice.message.content.clone().filter(|c| !c.is_empty());

    let mut tool_calls = Vec::new();
    if let Some(ref tcs) = choice.message.tool_calls {
        for tc in tcs {
            match parse_native_json_tool_call(tc.id.as_deref(), &tc.function.name, &tc.function.arguments) {
                Ok(call) => tool_calls.push(call),
                Err(e) => tracing::warn!(tool = %tc.function.name, error = %e, "dropping malformed native tool call"),
            }
        }
    }

    let finish_reason = if !tool_calls.is_empty() {
        Some("tool_calls".into())
    } else {
        choice.finish_reason.clone()
    };

    Ok(StreamChunk {
        token: content,
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        finish_reason,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
