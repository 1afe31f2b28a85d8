//! Shared types for the inference layer.
//!
//! Two families live here:
//! - provider-neutral conversation types (`Message`, `ToolCall`, `ChatRequest`)
//!   that flow between sessions and adapters, and
//! - OpenAI Chat Completions wire types, used by the HTTP adapter for request
//!   building and response parsing.

use serde::{Deserialize, Serialize};

// ─── Conversation Types ──────────────────────────────────────────────────────

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A structured action request extracted from a model reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique within one extraction batch (generated if the model doesn't provide one).
    pub id: String,
    /// Tool name as registered in the tool registry.
    pub name: String,
    /// Parsed arguments.
    pub arguments: serde_json::Map<String, serde_json::Value>,
    /// Textual result, filled exactly once by the dispatch loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            result: None,
        }
    }
}

/// A single conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tool calls carried by an assistant reply, in the order the model issued them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For `tool` role: the ID of the tool call this result belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Assistant reply carrying tool calls.
    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    /// Tool-result message for a resolved call.
    ///
    /// An unresolved call (no `result`) produces an empty content string.
    pub fn tool_result(call: &ToolCall) -> Self {
        Self {
            tool_call_id: Some(call.id.clone()),
            ..Self::with_role(Role::Tool, call.result.clone().unwrap_or_default())
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Tool catalog entry sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON-schema-like object: `{"type":"object","properties":{…},"required":[…]}`.
    pub parameters: serde_json::Value,
}

/// Generation parameters for a single request.
///
/// Unset fields fall back to the service's configured defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// A provider-neutral chat request handed to a `BackendAdapter`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub params: GenerationParams,
}

// ─── Wire Request Types ──────────────────────────────────────────────────────

/// A single message in the OpenAI wire format.
///
/// `content` serializes as `""` (not `null`) when absent: several
/// OpenAI-compatible runtimes reject `null` content on assistant messages
/// that carry tool calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(serialize_with = "serialize_content")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallResponse>>,
}

fn serialize_content<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(s) => serializer.serialize_str(s),
        None => serializer.serialize_str(""),
    }
}

impl From<&Message> for ChatMessage {
    fn from(msg: &Message) -> Self {
        let tool_calls = if msg.tool_calls.is_empty() {
            None
        } else {
            Some(
                msg.tool_calls
                    .iter()
                    .map(|tc| ToolCallResponse {
                        id: tc.id.clone(),
                        r#type: "function".to_string(),
                        function: FunctionCallResponse {
                            name: tc.name.clone(),
                            arguments: serde_json::Value::Object(tc.arguments.clone())
                                .to_string(),
                        },
                    })
                    .collect(),
            )
        };

        Self {
            role: msg.role,
            content: if msg.content.is_empty() {
                None
            } else {
                Some(msg.content.clone())
            },
            tool_call_id: msg.tool_call_id.clone(),
            tool_calls,
        }
    }
}

/// Tool definition sent in the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub r#type: String,
    pub function: FunctionDefinition,
}

/// Function definition within a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl From<&ToolSpec> for ToolDefinition {
    fn from(spec: &ToolSpec) -> Self {
        Self {
            r#type: "function".to_string(),
            function: FunctionDefinition {
                name: spec.name.clone(),
                description: spec.description.clone(),
                parameters: spec.parameters.clone(),
            },
        }
    }
}

/// Request body for `POST /chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    pub max_tokens: u32,
    pub stream: bool,
}

// ─── Wire Response Types ─────────────────────────────────────────────────────

/// Tool call as returned in the OpenAI response format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub id: String,
    pub r#type: String,
    pub function: FunctionCallResponse,
}

/// Function call details in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    pub name: String,
    pub arguments: String,
}

/// A single decoded SSE event.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    /// Incremental text token (if this chunk carries text).
    pub token: Option<String>,
    /// Native tool calls completed by this chunk.
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Why the model stopped: `"stop"`, `"tool_calls"`, or `None` (still going).
    pub finish_reason: Option<String>,
}

/// Raw SSE chunk from the OpenAI API.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    /// Some providers report failures mid-stream as an `error` object.
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// A single choice within a streaming chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

/// The delta (incremental update) within a chunk choice.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ChunkToolCall>>,
}

/// A tool call fragment within a streaming delta.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkToolCall {
    pub index: Option<u32>,
    pub id: Option<String>,
    pub function: Option<ChunkFunction>,
}

/// A function call fragment within a streaming tool call.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkFunction {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
