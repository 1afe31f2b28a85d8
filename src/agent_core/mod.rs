//! Agent Core — conversation orchestration on top of the inference layer.
//!
//! Submodules:
//! - `conversation`: In-memory conversation history with checkpoint/rollback
//! - `tool_router`: Tool trait, registry and fault-tolerant dispatch
//! - `session`: Multi-hop tool dispatch loop producing one reply per send
//! - `failover`: Rotation between backend services on rate limits
//! - `errors`: Agent-level error types

pub mod conversation;
pub mod errors;
pub mod failover;
pub mod session;
pub mod tool_router;

// Re-exports for convenience
pub use conversation::Conversation;
pub use errors::AgentError;
pub use failover::{build_services, BackendService, FailoverController, FailoverState, ServiceStatus};
pub use session::{ConversationSession, SessionOptions};
pub use tool_router::{Tool, ToolRegistry};
