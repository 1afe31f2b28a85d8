//! Failover controller — rotates between backend services on rate limits.
//!
//! The controller owns one conversation session and an ordered list of
//! services. Each `send` is delegated to the session bound to the current
//! service; a rate-limit-class failure marks that service and moves on to the
//! next one, wrapping around, until a send succeeds or the attempt budget
//! (`attempts_per_service × services`) is spent.
//!
//! Any other failure is returned immediately without rotation.
//!
//! ```text
//! Attempting(i) ──ok──────────► Succeeded
//!      │
//!      └─rate limited─► Attempting((i + 1) mod N) … ─budget spent─► ExhaustedFailure
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::inference::adapter::{BackendAdapter, StreamEvent};
use crate::inference::client::build_adapter;
use crate::inference::config::RelayConfig;
use crate::inference::types::Message;

use super::errors::AgentError;
use super::session::{ConversationSession, SessionOptions};
use super::tool_router::ToolRegistry;

/// Default attempt budget per service.
pub const DEFAULT_ATTEMPTS_PER_SERVICE: usize = 3;

// ─── Public Types ───────────────────────────────────────────────────────────

/// A named backend the controller can route to.
#[derive(Clone)]
pub struct BackendService {
    pub name: String,
    pub adapter: Arc<dyn BackendAdapter>,
}

impl BackendService {
    pub fn new(name: impl Into<String>, adapter: Arc<dyn BackendAdapter>) -> Self {
        Self {
            name: name.into(),
            adapter,
        }
    }
}

impl std::fmt::Debug for BackendService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendService")
            .field("name", &self.name)
            .field("adapter", &self.adapter.name())
            .finish()
    }
}

/// Rate-limit history of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub service: String,
    /// Consecutive rate-limit failures; reset on success.
    pub failure_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Where the controller is in its rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    /// Sending through the service at this index.
    Attempting(usize),
    /// The last send succeeded.
    Succeeded,
    /// The last send ran out of attempts.
    ExhaustedFailure,
}

// ─── FailoverController ─────────────────────────────────────────────────────

pub struct FailoverController {
    services: Vec<BackendService>,
    statuses: Vec<ServiceStatus>,
    current_index: usize,
    session: ConversationSession,
    state: FailoverState,
    attempts_per_service: usize,
}

impl FailoverController {
    /// Create a controller starting at the first service.
    pub fn new(
        services: Vec<BackendService>,
        tools: Arc<ToolRegistry>,
        options: SessionOptions,
    ) -> Result<Self, AgentError> {
        let first = services.first().ok_or(AgentError::NoServices)?;
        let session = ConversationSession::new(first.adapter.clone(), tools, options);
        let statuses = services
            .iter()
            .map(|s| ServiceStatus {
                service: s.name.clone(),
                failure_count: 0,
                last_failure: None,
            })
            .collect();

        Ok(Self {
            services,
            statuses,
            current_index: 0,
            session,
            state: FailoverState::Attempting(0),
            attempts_per_service: DEFAULT_ATTEMPTS_PER_SERVICE,
        })
    }

    /// Build services, session options and rotation settings from config.
    pub fn from_config(config: &RelayConfig, tools: Arc<ToolRegistry>) -> Result<Self, AgentError> {
        config.validate()?;
        let services = build_services(config)?;
        Ok(Self::new(services, tools, SessionOptions::from_config(config))?
            .with_initial_service(config.initial_service_index())
            .with_attempts_per_service(config.failover.attempts_per_service))
    }

    /// Start rotation at `index` (clamped into range).
    pub fn with_initial_service(mut self, index: usize) -> Self {
        let index = index.min(self.services.len() - 1);
        self.current_index = index;
        self.state = FailoverState::Attempting(index);
        self.session.set_adapter(self.services[index].adapter.clone());
        self
    }

    pub fn with_attempts_per_service(mut self, attempts: usize) -> Self {
        self.attempts_per_service = attempts.max(1);
        self
    }

    pub fn state(&self) -> FailoverState {
        self.state
    }

    pub fn statuses(&self) -> &[ServiceStatus] {
        &self.statuses
    }

    /// Name of the service the next send will try first.
    pub fn current_service(&self) -> &str {
        &self.services[self.current_index].name
    }

    pub fn session(&self) -> &ConversationSession {
        &self.session
    }

    /// Total attempt budget for one send.
    pub fn max_attempts(&self) -> usize {
        self.attempts_per_service * self.services.len()
    }

    pub async fn send(&mut self, message: Option<Message>) -> Result<Message, AgentError> {
        self.send_with_listener(message, |_| {}).await
    }

    /// Send through the current service, rotating on rate limits.
    ///
    /// The listener sees the events of every attempt, including partial
    /// output of attempts that later failed. Hops whose tools completed
    /// before a rate limit are kept, and the next service picks up from them.
    pub async fn send_with_listener<F>(
        &mut self,
        message: Option<Message>,
        mut on_event: F,
    ) -> Result<Message, AgentError>
    where
        F: FnMut(&StreamEvent),
    {
        let service_count = self.services.len();
        let max_attempts = self.max_attempts();
        let mut last_error: Option<AgentError> = None;

        for attempt in 1..=max_attempts {
            let index = self.current_index;
            self.state = FailoverState::Attempting(index);
            self.session.set_adapter(self.services[index].adapter.clone());

            // A retry after tools already ran continues that turn on the
            // next service instead of replaying the message.
            let outgoing = if attempt > 1 && self.session.has_interrupted_turn() {
                None
            } else {
                message.clone()
            };

            match self
                .session
                .send_with_listener(outgoing, &mut on_event)
                .await
            {
                Ok(reply) => {
                    self.statuses[index].failure_count = 0;
                    self.state = FailoverState::Succeeded;
                    tracing::info!(service = %self.services[index].name, attempt, "send succeeded");
                    return Ok(reply);
                }
                Err(e) if e.is_rate_limited() => {
                    let status = &mut self.statuses[index];
                    status.failure_count += 1;
                    status.last_failure = Some(Utc::now());
                    self.current_index = (index + 1) % service_count;

                    tracing::warn!(
                        service = %self.services[index].name,
                        failure_count = status.failure_count,
                        attempt,
                        max_attempts,
                        next_service = %self.services[self.current_index].name,
                        error = %e,
                        "service rate limited, rotating"
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    tracing::warn!(
                        service = %self.services[index].name,
                        attempt,
                        error = %e,
                        "send failed without rate limiting, not rotating"
                    );
                    return Err(e);
                }
            }
        }

        self.state = FailoverState::ExhaustedFailure;
        tracing::error!(attempts = max_attempts, "all services rate limited");
        Err(AgentError::FailoverExhausted {
            attempts: max_attempts,
            last_error: Box::new(last_error.unwrap_or(AgentError::NoServices)),
        })
    }
}

/// One `BackendService` per configured service, in config order.
pub fn build_services(config: &RelayConfig) -> Result<Vec<BackendService>, AgentError> {
    config
        .services
        .iter()
        .map(|service| -> Result<BackendService, AgentError> {
            let adapter = build_adapter(service, config.generation)?;
            Ok(BackendService::new(service.name.clone(), adapter))
        })
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
