//! Inference layer — talking to LLM backends through one uniform interface.
//!
//! This module handles everything below the conversation session:
//! - The `BackendAdapter` contract and its event stream
//! - An OpenAI-compatible HTTP adapter (streaming and non-streaming)
//! - The text tool-call protocol for backends without native tool calling
//!   (system-prompt catalog, streaming tag scanner, tool-call extractor)
//! - Service configuration loading from `toolrelay.yaml`
//!
//! Switching providers is a config change, not a code change.

pub mod adapter;
pub mod client;
pub mod config;
pub mod errors;
pub mod prompt;
pub mod scanner;
pub mod streaming;
pub mod text_protocol;
pub mod tool_call_parser;
pub mod types;

#[cfg(test)]
pub(crate) mod scripted;

// Re-exports for convenience
pub use adapter::{BackendAdapter, StreamEvent, StreamHandle, StreamSender};
pub use client::{build_adapter, OpenAiCompatAdapter};
pub use config::{RelayConfig, ServiceConfig, ToolProtocol};
pub use errors::InferenceError;
pub use text_protocol::TextToolProtocol;
pub use types::{ChatRequest, GenerationParams, Message, Role, ToolCall, ToolSpec};
