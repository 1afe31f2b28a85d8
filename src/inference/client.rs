//! OpenAI-compatible backend adapter.
//!
//! Sends chat completion requests to one configured service and turns the
//! response (SSE or a single JSON body) into `StreamEvent`s.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;

use super::adapter::{BackendAdapter, StreamHandle, StreamSender};
use super::config::{GenerationConfig, ServiceConfig, ToolProtocol};
use super::errors::InferenceError;
use super::streaming::{parse_non_streaming_response, parse_sse_stream};
use super::text_protocol::TextToolProtocol;
use super::tool_call_parser::ToolCallExtractor;
use super::types::{
    ChatCompletionRequest, ChatMessage, ChatRequest, Message, StreamChunk, ToolCall,
    ToolDefinition,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout for non-streaming calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Total request timeout for streaming calls.
///
/// Large contexts can take a long time before the first token arrives.
const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

// ─── OpenAiCompatAdapter ─────────────────────────────────────────────────────

/// Adapter for one OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatAdapter {
    /// HTTP client for non-streaming requests.
    http: HttpClient,
    /// HTTP client for streaming requests (longer timeout).
    http_stream: HttpClient,
    service: ServiceConfig,
    defaults: GenerationConfig,
}

impl OpenAiCompatAdapter {
    /// Create an adapter for `service`. Does NOT check connectivity — that
    /// happens on the first request.
    pub fn new(service: ServiceConfig, defaults: GenerationConfig) -> Result<Self, InferenceError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: service.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let http_stream = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(STREAM_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: service.base_url.clone(),
                reason: format!("failed to build streaming HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            http_stream,
            service,
            defaults,
        })
    }

    pub fn service(&self) -> &ServiceConfig {
        &self.service
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.service.base_url.trim_end_matches('/'))
    }

    /// Build the wire request. Precedence for sampling values: request, then
    /// service, then generation defaults.
    fn build_request_body(&self, request: &ChatRequest) -> ChatCompletionRequest {
        let tools: Option<Vec<ToolDefinition>> = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.iter().map(ToolDefinition::from).collect())
        };

        ChatCompletionRequest {
            model: self.service.model.clone(),
            messages: request.messages.iter().map(ChatMessage::from).collect(),
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            tools,
            temperature: request
                .params
                .temperature
                .or(self.service.temperature)
                .unwrap_or(self.defaults.temperature),
            top_p: request.params.top_p.or(self.defaults.top_p),
            max_tokens: request
                .params
                .max_tokens
                .or(self.service.max_tokens)
                .unwrap_or(self.defaults.max_tokens),
            stream: self.service.streaming,
        }
    }

    /// Send the request and check the status. Non-2xx becomes `HttpError`.
    async fn post(&self, body: &ChatCompletionRequest) -> Result<reqwest::Response, InferenceError> {
        let url = self.endpoint();

        // Log the request metadata (not the full body — it can be huge)
        tracing::info!(
            service = %self.service.name,
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            max_tokens = body.max_tokens,
            stream = body.stream,
            "sending chat completion request"
        );

        let (client, timeout) = if body.stream {
            (&self.http_stream, STREAM_REQUEST_TIMEOUT)
        } else {
            (&self.http, REQUEST_TIMEOUT)
        };

        let mut builder = client.post(&url).json(body);
        if body.stream {
            builder = builder.header("Accept", "text/event-stream");
        }
        if let Some(key) = self.service.api_key.as_deref().filter(|k| !k.is_empty()) {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_transport_error(e, &url, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            tracing::warn!(
                service = %self.service.name,
                status = status.as_u16(),
                body = %body_text,
                "chat completion request rejected"
            );
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl BackendAdapter for OpenAiCompatAdapter {
    fn name(&self) -> &str {
        &self.service.name
    }

    async fn send(&self, request: ChatRequest) -> Result<StreamHandle, InferenceError> {
        let body = self.build_request_body(&request);
        let response = self.post(&body).await?;
        let (tx, handle) = StreamHandle::channel();

        if body.stream {
            tokio::spawn(pump_sse(response, tx));
        } else {
            let body_text = response.text().await.map_err(|e| InferenceError::StreamError {
                reason: format!("failed to read response body: {e}"),
            })?;
            let chunk = parse_non_streaming_response(&body_text)?;
            let mut reply = ReplyAccumulator::default();
            reply.apply(chunk, &tx);
            reply.complete(&tx);
        }

        Ok(handle)
    }
}

/// Collects streamed text and native calls into the final message.
///
/// Providers that repeat call ids (`call_0` for every call) get fresh ids so
/// each result can be matched to its call.
#[derive(Default)]
struct ReplyAccumulator {
    content: String,
    calls: Vec<ToolCall>,
    ids: ToolCallExtractor,
}

impl ReplyAccumulator {
    fn apply(&mut self, chunk: StreamChunk, tx: &StreamSender) {
        if let Some(token) = chunk.token {
            self.content.push_str(&token);
            tx.chunk(token);
        }
        for call in chunk.tool_calls.into_iter().flatten() {
            let call = self.ids.admit(call);
            self.calls.push(call.clone());
            tx.tool_call(call);
        }
    }

    fn complete(self, tx: &StreamSender) {
        tx.complete(Message::assistant_with_calls(self.content, self.calls));
    }
}

/// Forward SSE chunks to the handle until the stream ends or fails.
async fn pump_sse(response: reqwest::Response, tx: StreamSender) {
    let stream = parse_sse_stream(response);
    futures::pin_mut!(stream);

    let mut reply = ReplyAccumulator::default();
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => reply.apply(chunk, &tx),
            Err(e) => {
                tracing::warn!(error = %e, "stream failed mid-response");
                tx.error(e);
                return;
            }
        }
        if tx.is_closed() {
            return;
        }
    }
    reply.complete(&tx);
}

fn map_transport_error(e: reqwest::Error, url: &str, timeout: Duration) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout {
            duration_secs: timeout.as_secs(),
        }
    } else {
        InferenceError::ConnectionFailed {
            endpoint: url.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Build the adapter stack for one configured service.
///
/// Services using the text protocol get their HTTP adapter wrapped in
/// [`TextToolProtocol`].
pub fn build_adapter(
    service: &ServiceConfig,
    defaults: GenerationConfig,
) -> Result<Arc<dyn BackendAdapter>, InferenceError> {
    let http = OpenAiCompatAdapter::new(service.clone(), defaults)?;
    Ok(match service.tool_protocol {
        ToolProtocol::Native => Arc::new(http),
        ToolProtocol::Text => Arc::new(TextToolProtocol::new(http)),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
