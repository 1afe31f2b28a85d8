//! Agent Core error types.

use thiserror::Error;

use crate::inference::errors::InferenceError;

/// Errors that can occur while running a conversation.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The backend request failed (transport, provider or stream error).
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// The model kept requesting tools past the configured hop bound.
    #[error("tool dispatch loop exceeded {max_hops} hops")]
    HopLimitExceeded { max_hops: usize },

    /// A failover controller was created without any service.
    #[error("no backend services configured")]
    NoServices,

    /// Every service was rate limited until the attempt budget ran out.
    #[error("all services rate limited after {attempts} attempts; last error: {last_error}")]
    FailoverExhausted {
        attempts: usize,
        #[source]
        last_error: Box<AgentError>,
    },
}

impl AgentError {
    /// Whether this failure should rotate to the next service.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            AgentError::Inference(e) => e.is_rate_limited(),
            _ => false,
        }
    }
}
