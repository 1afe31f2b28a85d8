//! Conversation history — the ordered, append-only message log of a session.
//!
//! Responsibilities:
//! - Store messages in arrival order
//! - Build the message list sent to the backend (system prompt + history)
//! - Record tool results on the assistant message that issued the call
//! - Roll back to a checkpoint when a `send` fails

use uuid::Uuid;

use crate::inference::types::{Message, Role};

// ─── Conversation ───────────────────────────────────────────────────────────

/// In-memory conversation history.
#[derive(Debug, Clone)]
pub struct Conversation {
    id: String,
    messages: Vec<Message>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
        }
    }

    /// Unique id for log correlation.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Append a message. Returns its index.
    pub fn push(&mut self, message: Message) -> usize {
        self.messages.push(message);
        self.messages.len() - 1
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The current length, to pass to [`Conversation::rollback`] later.
    pub fn checkpoint(&self) -> usize {
        self.messages.len()
    }

    /// Drop every message appended after `checkpoint`.
    pub fn rollback(&mut self, checkpoint: usize) {
        if checkpoint < self.messages.len() {
            tracing::debug!(
                conversation = %self.id,
                dropped = self.messages.len() - checkpoint,
                "rolling back conversation history"
            );
            self.messages.truncate(checkpoint);
        }
    }

    /// Record a tool result on the call `call_id` of the message at `index`.
    ///
    /// Returns `false` if there is no such assistant message or call.
    pub fn set_tool_result(&mut self, index: usize, call_id: &str, result: &str) -> bool {
        let Some(message) = self.messages.get_mut(index) else {
            return false;
        };
        if message.role != Role::Assistant {
            return false;
        }
        match message.tool_calls.iter_mut().find(|c| c.id == call_id) {
            Some(call) => {
                call.result = Some(result.to_string());
                true
            }
            None => false,
        }
    }

    /// Messages for a backend request: optional system prompt, then history.
    pub fn build_context(&self, system_prompt: Option<&str>) -> Vec<Message> {
        let mut context = Vec::with_capacity(self.messages.len() + 1);
        if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
            context.push(Message::system(prompt));
        }
        context.extend(self.messages.iter().cloned());
        context
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
