//! Tool registry and dispatch — executes model tool calls.
//!
//! The registry is the bridge between the model's tool call decisions and the
//! tool implementations. It handles:
//! - Lookup by name (unknown names become an error result)
//! - Execution with panic containment
//! - Structured logging of every execution with its duration
//!
//! Dispatch never fails: every outcome is rendered into the text the model
//! sees as the call's result.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Map, Value};

use crate::inference::types::{ToolCall, ToolSpec};

// ─── Tool Trait ──────────────────────────────────────────────────────────────

/// A callable tool exposed to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the arguments: `{"type":"object","properties":{…},"required":[…]}`.
    fn parameters(&self) -> Value;

    /// Run the tool. Any error is reported to the model as the call's result.
    async fn call(&self, arguments: &Map<String, Value>) -> anyhow::Result<String>;
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Named tools, in registration order.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool with the same name is replaced in place.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name);
        }
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Registered names in registration order.
    pub fn tool_names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    /// Catalog sent to the backend, in registration order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Execute one call and render its outcome as result text.
    pub async fn dispatch(&self, call: &ToolCall) -> String {
        let start = Instant::now();

        let Some(tool) = self.tools.get(&call.name) else {
            tracing::warn!(tool = %call.name, id = %call.id, "model requested an unknown tool");
            return format!(
                "Error: unknown tool '{}'. Available tools: {}",
                call.name,
                self.available_list()
            );
        };

        let outcome = AssertUnwindSafe(tool.call(&call.arguments))
            .catch_unwind()
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(output)) => {
                tracing::info!(
                    tool = %call.name,
                    id = %call.id,
                    elapsed_ms,
                    result_len = output.len(),
                    "tool executed"
                );
                output
            }
            Ok(Err(e)) => {
                tracing::warn!(tool = %call.name, id = %call.id, elapsed_ms, error = %e, "tool failed");
                format!("Error executing '{}': {e:#}", call.name)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(tool = %call.name, id = %call.id, elapsed_ms, panic = %message, "tool panicked");
                format!("Error executing '{}': tool panicked: {message}", call.name)
            }
        }
    }

    fn available_list(&self) -> String {
        if self.order.is_empty() {
            "(none)".to_string()
        } else {
            self.order.join(", ")
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
