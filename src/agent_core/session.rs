//! Conversation session — the multi-hop tool dispatch loop.
//!
//! One `send` may take several backend requests ("hops"): whenever a reply
//! carries tool calls, each call is executed in order, its result appended to
//! history, and the backend asked to continue. The caller gets a single merged
//! reply per `send`.
//!
//! ```text
//! user ─► hop 1: assistant (calls a, b) ─► tool a ─► tool b
//!      ─► hop 2: assistant (final text)  ─► merged reply
//! ```
//!
//! A failed `send` leaves history as it was before the call, unless tools
//! already ran. Then the completed hops stay in history (their side effects
//! happened) and the next `send(None)` resumes the interrupted turn, so no
//! tool runs twice.

use std::sync::Arc;

use crate::inference::adapter::{BackendAdapter, StreamEvent};
use crate::inference::config::RelayConfig;
use crate::inference::tool_call_parser::ToolCallExtractor;
use crate::inference::types::{ChatRequest, GenerationParams, Message, ToolCall};

use super::conversation::Conversation;
use super::errors::AgentError;
use super::tool_router::ToolRegistry;

/// Default bound on backend requests per `send`.
pub const DEFAULT_MAX_HOPS: usize = 25;

/// Separator between the text of consecutive hops in a merged reply.
/// Hops with blank text contribute nothing, not an empty paragraph.
const HOP_SEPARATOR: &str = "\n\n";

// ─── Options ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Prepended to every request; not stored in history.
    pub system_prompt: Option<String>,
    pub params: GenerationParams,
    pub max_hops: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            params: GenerationParams::default(),
            max_hops: DEFAULT_MAX_HOPS,
        }
    }
}

impl SessionOptions {
    /// Session settings from the `session` section. Generation defaults are
    /// applied by each service's adapter, so request params stay unset.
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            system_prompt: config.session.system_prompt.clone(),
            params: GenerationParams::default(),
            max_hops: config.session.max_hops,
        }
    }
}

// ─── Turn State ─────────────────────────────────────────────────────────────

/// Progress of one `send`: the hops whose tools have run.
#[derive(Debug, Default)]
struct Turn {
    contents: Vec<String>,
    resolved: Vec<ToolCall>,
    hops: usize,
}

impl Turn {
    fn push_content(&mut self, content: String) {
        if !content.trim().is_empty() {
            self.contents.push(content);
        }
    }
}

// ─── ConversationSession ────────────────────────────────────────────────────

pub struct ConversationSession {
    adapter: Arc<dyn BackendAdapter>,
    tools: Arc<ToolRegistry>,
    history: Conversation,
    options: SessionOptions,
    /// A turn interrupted after some of its tools ran.
    interrupted: Option<Turn>,
}

impl ConversationSession {
    pub fn new(
        adapter: Arc<dyn BackendAdapter>,
        tools: Arc<ToolRegistry>,
        options: SessionOptions,
    ) -> Self {
        Self {
            adapter,
            tools,
            history: Conversation::new(),
            options,
            interrupted: None,
        }
    }

    /// Switch the backend used by subsequent sends. History is kept.
    pub fn set_adapter(&mut self, adapter: Arc<dyn BackendAdapter>) {
        self.adapter = adapter;
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    pub fn history(&self) -> &Conversation {
        &self.history
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Whether the last send failed after running tools; `send(None)`
    /// resumes it.
    pub fn has_interrupted_turn(&self) -> bool {
        self.interrupted.is_some()
    }

    /// Send `message` (if any) and resolve tool calls until a final reply.
    pub async fn send(&mut self, message: Option<Message>) -> Result<Message, AgentError> {
        self.send_with_listener(message, |_| {}).await
    }

    /// Like [`send`](Self::send), forwarding every adapter event of every hop
    /// to `on_event`. The listener is dropped when this call returns.
    pub async fn send_with_listener<F>(
        &mut self,
        message: Option<Message>,
        mut on_event: F,
    ) -> Result<Message, AgentError>
    where
        F: FnMut(&StreamEvent),
    {
        let mut committed = self.history.checkpoint();
        let mut turn = match message {
            Some(message) => {
                if self.interrupted.take().is_some() {
                    tracing::info!(
                        conversation = %self.history.id(),
                        "new message abandons the interrupted turn"
                    );
                }
                self.history.push(message);
                Turn::default()
            }
            None => self.interrupted.take().unwrap_or_default(),
        };

        match self.run_hops(&mut turn, &mut committed, &mut on_event).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                // Only the hop in flight is undone.
                self.history.rollback(committed);
                if turn.hops > 0 && !matches!(e, AgentError::HopLimitExceeded { .. }) {
                    tracing::info!(
                        conversation = %self.history.id(),
                        completed_hops = turn.hops,
                        tool_calls = turn.resolved.len(),
                        "keeping completed hops of the interrupted turn"
                    );
                    self.interrupted = Some(turn);
                }
                Err(e)
            }
        }
    }

    /// Run hops until a reply without tool calls. `committed` advances past
    /// each hop once all of its tool results are in history.
    async fn run_hops<F>(
        &mut self,
        turn: &mut Turn,
        committed: &mut usize,
        on_event: &mut F,
    ) -> Result<Message, AgentError>
    where
        F: FnMut(&StreamEvent),
    {
        let specs = self.tools.specs();

        while turn.hops < self.options.max_hops {
            let request = ChatRequest {
                messages: self
                    .history
                    .build_context(self.options.system_prompt.as_deref()),
                tools: specs.clone(),
                params: self.options.params,
            };

            tracing::debug!(
                conversation = %self.history.id(),
                adapter = self.adapter.name(),
                hop = turn.hops,
                message_count = request.messages.len(),
                "starting hop"
            );

            let handle = self.adapter.send(request).await?;
            let mut reply = handle.finish(&mut *on_event).await?;

            // Results are matched to calls by id, so ids must be distinct.
            let mut ids = ToolCallExtractor::new();
            reply.tool_calls = reply
                .tool_calls
                .into_iter()
                .map(|call| ids.admit(call))
                .collect();
            let reply_index = self.history.push(reply.clone());

            if !reply.has_tool_calls() {
                if turn.hops == 0 {
                    return Ok(reply);
                }
                turn.push_content(reply.content);
                tracing::info!(
                    conversation = %self.history.id(),
                    hops = turn.hops + 1,
                    tool_calls = turn.resolved.len(),
                    "reply complete"
                );
                return Ok(Message::assistant_with_calls(
                    std::mem::take(&mut turn.contents).join(HOP_SEPARATOR),
                    std::mem::take(&mut turn.resolved),
                ));
            }

            turn.push_content(reply.content);

            for mut call in reply.tool_calls {
                let result = self.tools.dispatch(&call).await;
                self.history.set_tool_result(reply_index, &call.id, &result);
                call.result = Some(result);
                self.history.push(Message::tool_result(&call));
                turn.resolved.push(call);
            }

            turn.hops += 1;
            *committed = self.history.checkpoint();
        }

        tracing::warn!(
            conversation = %self.history.id(),
            max_hops = self.options.max_hops,
            "tool dispatch loop hit the hop limit"
        );
        Err(AgentError::HopLimitExceeded {
            max_hops: self.options.max_hops,
        })
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{json, Map, Value};

    use crate::agent_core::tool_router::Tool;
    use crate::inference::errors::InferenceError;
    use crate::inference::scripted::{Scripted, ScriptedAdapter};
    use crate::inference::text_protocol::TextToolProtocol;
    use crate::inference::types::Role;

    /// Records the order of invocations and returns a fixed result.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Tool for Recorder {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "Records calls."
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn call(&self, _arguments: &Map<String, Value>) -> anyhow::Result<String> {
            self.log.lock().unwrap().push(self.name.to_string());
            Ok(format!("{} done", self.name))
        }
    }

    fn registry(log: &Arc<Mutex<Vec<String>>>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(Recorder { name: "a", log: log.clone() });
        registry.register(Recorder { name: "b", log: log.clone() });
        Arc::new(registry)
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall::new(id, name, Map::new())
    }

    fn session(adapter: Arc<dyn BackendAdapter>, tools: Arc<ToolRegistry>) -> ConversationSession {
        ConversationSession::new(adapter, tools, SessionOptions::default())
    }

    fn roles(session: &ConversationSession) -> Vec<Role> {
        session.history().messages().iter().map(|m| m.role).collect()
    }

    #[tokio::test]
    async fn test_two_calls_dispatched_sequentially_and_merged() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let adapter = Arc::new(ScriptedAdapter::new(
            "scripted",
            vec![
                Scripted::NativeCalls("Working on it.".into(), vec![call("c1", "a"), call("c2", "b")]),
                Scripted::Text("All done.".into()),
            ],
        ));
        let mut session = session(adapter.clone(), registry(&log));

        let reply = session.send(Some(Message::user("do both"))).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.content, "Working on it.\n\nAll done.");
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(reply.tool_calls[0].result.as_deref(), Some("a done"));
        assert_eq!(reply.tool_calls[1].result.as_deref(), Some("b done"));

        assert_eq!(
            roles(&session),
            vec![Role::User, Role::Assistant, Role::Tool, Role::Tool, Role::Assistant]
        );
        let history = session.history().messages();
        assert_eq!(history[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(history[2].content, "a done");
        assert_eq!(history[3].tool_call_id.as_deref(), Some("c2"));
        assert_eq!(history[1].tool_calls[1].result.as_deref(), Some("b done"));

        // The second hop sees both results.
        let requests = adapter.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages.len(), 4);
        assert_eq!(requests[0].tools.len(), 2);
    }

    #[tokio::test]
    async fn test_reply_without_calls_is_returned_unchanged() {
        let adapter = Arc::new(ScriptedAdapter::new("s", vec![Scripted::Text("Hello!".into())]));
        let mut session = session(adapter, Arc::new(ToolRegistry::new()));

        let reply = session.send(Some(Message::user("hi"))).await.unwrap();
        assert_eq!(reply, Message::assistant("Hello!"));
        assert_eq!(roles(&session), vec![Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_unknown_tool_result_is_reported_to_model() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let adapter = Arc::new(ScriptedAdapter::new(
            "s",
            vec![
                Scripted::NativeCalls(String::new(), vec![call("c1", "missing")]),
                Scripted::Text("Sorry, I cannot do that.".into()),
            ],
        ));
        let mut session = session(adapter, registry(&log));

        let reply = session.send(Some(Message::user("go"))).await.unwrap();
        let result = reply.tool_calls[0].result.as_deref().unwrap();
        assert!(result.starts_with("Error: unknown tool 'missing'"));
        assert!(result.contains("a, b"));
        assert_eq!(reply.content, "Sorry, I cannot do that.", "empty hop text is skipped");
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_text_protocol_end_to_end() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = ScriptedAdapter::new(
            "text",
            vec![
                Scripted::Text(
                    "First a.<ToolCall>{\"tool\":\"a\",\"parameters\":{}}</ToolCall>\
                     <tool_call>{\"name\":\"b\"}</tool_call>"
                        .into(),
                ),
                Scripted::Text("Both ran.".into()),
            ],
        );
        let mut session = session(Arc::new(TextToolProtocol::new(inner)), registry(&log));

        let mut streamed = String::new();
        let reply = session
            .send_with_listener(Some(Message::user("run a then b")), |event| {
                if let StreamEvent::Chunk(text) = event {
                    streamed.push_str(text);
                }
            })
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(reply.content, "First a.\n\nBoth ran.");
        assert_eq!(reply.tool_calls.len(), 2);
        assert_eq!(streamed, "First a.Both ran.");
        assert!(!streamed.contains("ToolCall"));
    }

    #[tokio::test]
    async fn test_hop_limit_exceeded_keeps_completed_hops() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let adapter = Arc::new(ScriptedAdapter::repeating(
            "loop",
            Scripted::NativeCalls(String::new(), vec![call("c1", "a")]),
        ));
        let options = SessionOptions {
            max_hops: 3,
            ..SessionOptions::default()
        };
        let mut session = ConversationSession::new(adapter.clone(), registry(&log), options);

        let err = session.send(Some(Message::user("loop"))).await.unwrap_err();
        assert!(matches!(err, AgentError::HopLimitExceeded { max_hops: 3 }));
        assert_eq!(adapter.call_count(), 3);
        assert_eq!(log.lock().unwrap().len(), 3);
        assert_eq!(session.history().len(), 7, "user + 3 × (assistant, tool)");
        assert!(!session.has_interrupted_turn());
    }

    #[tokio::test]
    async fn test_failed_hop_after_tools_resumes_without_rerunning() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let adapter = Arc::new(ScriptedAdapter::new(
            "s",
            vec![
                Scripted::NativeCalls("Step one.".into(), vec![call("c1", "a")]),
                Scripted::HttpError(500, "upstream hiccup".into()),
                Scripted::Text("Finished.".into()),
            ],
        ));
        let mut session = session(adapter.clone(), registry(&log));

        let err = session.send(Some(Message::user("go"))).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Inference(InferenceError::HttpError { status: 500, .. })
        ));
        assert!(session.has_interrupted_turn());
        assert_eq!(roles(&session), vec![Role::User, Role::Assistant, Role::Tool]);

        let reply = session.send(None).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a"], "tool ran once");
        assert_eq!(reply.content, "Step one.\n\nFinished.");
        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].result.as_deref(), Some("a done"));
        assert_eq!(adapter.requests()[2].messages.len(), 3);
        assert_eq!(session.history().len(), 4);
        assert!(!session.has_interrupted_turn());
    }

    #[tokio::test]
    async fn test_new_message_abandons_interrupted_turn() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let adapter = Arc::new(ScriptedAdapter::new(
            "s",
            vec![
                Scripted::NativeCalls(String::new(), vec![call("c1", "a")]),
                Scripted::HttpError(500, "boom".into()),
                Scripted::Text("fresh".into()),
            ],
        ));
        let mut session = session(adapter, registry(&log));
        session.send(Some(Message::user("first"))).await.unwrap_err();

        let reply = session.send(Some(Message::user("second"))).await.unwrap();
        assert_eq!(reply, Message::assistant("fresh"));
        assert!(!session.has_interrupted_turn());
        assert_eq!(session.history().len(), 5);
    }

    #[tokio::test]
    async fn test_repeated_native_ids_get_distinct_results() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let adapter = Arc::new(ScriptedAdapter::new(
            "s",
            vec![
                Scripted::NativeCalls(String::new(), vec![call("call_0", "a"), call("call_0", "b")]),
                Scripted::Text("ok".into()),
            ],
        ));
        let mut session = session(adapter, registry(&log));

        let reply = session.send(Some(Message::user("both"))).await.unwrap();
        assert_eq!(reply.tool_calls[0].result.as_deref(), Some("a done"));
        assert_eq!(reply.tool_calls[1].result.as_deref(), Some("b done"));

        let history = session.history().messages();
        assert_eq!(history[1].tool_calls[0].result.as_deref(), Some("a done"));
        assert_eq!(history[1].tool_calls[1].result.as_deref(), Some("b done"));
        assert_eq!(history[2].tool_call_id.as_deref(), Some("call_0"));
        assert_eq!(history[3].tool_call_id.as_deref(), Some(history[1].tool_calls[1].id.as_str()));
        assert_ne!(history[2].tool_call_id, history[3].tool_call_id);
    }

    #[tokio::test]
    async fn test_blank_hop_text_adds_no_separator() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let adapter = Arc::new(ScriptedAdapter::new(
            "s",
            vec![
                Scripted::NativeCalls("Working.".into(), vec![call("c1", "a")]),
                Scripted::Text("  ".into()),
            ],
        ));
        let mut session = session(adapter, registry(&log));

        let reply = session.send(Some(Message::user("go"))).await.unwrap();
        assert_eq!(reply.content, "Working.");
        assert_eq!(reply.tool_calls.len(), 1);
    }

    #[tokio::test]
    async fn test_listener_sees_stream_error() {
        let adapter = Arc::new(ScriptedAdapter::new(
            "s",
            vec![Scripted::StreamFailure("boom".into())],
        ));
        let mut session = session(adapter, Arc::new(ToolRegistry::new()));

        let mut seen = Vec::new();
        let result = session
            .send_with_listener(Some(Message::user("hi")), |event| {
                seen.push(match event {
                    StreamEvent::Chunk(_) => "chunk",
                    StreamEvent::ToolCall(_) => "tool_call",
                    StreamEvent::Error(_) => "error",
                    StreamEvent::Complete(_) => "complete",
                });
            })
            .await;

        assert!(result.is_err());
        assert_eq!(seen, vec!["chunk", "error"]);
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn test_backend_error_propagates_and_rolls_back() {
        let adapter = Arc::new(ScriptedAdapter::new(
            "s",
            vec![
                Scripted::Text("first".into()),
                Scripted::HttpError(500, "boom".into()),
            ],
        ));
        let mut session = session(adapter, Arc::new(ToolRegistry::new()));
        session.send(Some(Message::user("one"))).await.unwrap();

        let err = session.send(Some(Message::user("two"))).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::Inference(InferenceError::HttpError { status: 500, .. })
        ));
        assert_eq!(session.history().len(), 2, "failed send leaves no trace");
    }

    #[tokio::test]
    async fn test_system_prompt_is_sent_not_stored() {
        let adapter = Arc::new(ScriptedAdapter::new("s", vec![Scripted::Text("ok".into())]));
        let options = SessionOptions {
            system_prompt: Some("Be brief.".into()),
            ..SessionOptions::default()
        };
        let mut session = ConversationSession::new(adapter.clone(), Arc::new(ToolRegistry::new()), options);

        session.send(Some(Message::user("hi"))).await.unwrap();
        let sent = &adapter.requests()[0].messages;
        assert_eq!(sent[0], Message::system("Be brief."));
        assert_eq!(session.history().messages()[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_send_without_message_continues_conversation() {
        let adapter = Arc::new(ScriptedAdapter::new(
            "s",
            vec![Scripted::Text("one".into()), Scripted::Text("two".into())],
        ));
        let mut session = session(adapter.clone(), Arc::new(ToolRegistry::new()));
        session.send(Some(Message::user("hi"))).await.unwrap();

        let reply = session.send(None).await.unwrap();
        assert_eq!(reply.content, "two");
        assert_eq!(adapter.requests()[1].messages.len(), 2);
        assert_eq!(session.history().len(), 3);
    }
}
