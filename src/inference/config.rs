//! Service configuration loading and validation.
//!
//! Reads `toolrelay.yaml` and resolves environment variables. Config is the
//! single source of truth for backend endpoints, tool protocols, generation
//! defaults and failover order.
//!
//! ```yaml
//! services:
//!   - name: primary
//!     base_url: https://api.example.com/v1
//!     model: large-model
//!     api_key: ${PRIMARY_API_KEY}
//!   - name: local
//!     base_url: http://localhost:11434/v1
//!     model: qwen2.5:7b
//!     tool_protocol: text
//! generation:
//!   temperature: 0.3
//!   max_tokens: 2048
//! session:
//!   max_hops: 10
//! failover:
//!   initial_service: local
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::errors::InferenceError;

/// Env var that points directly at a config file.
pub const CONFIG_ENV_VAR: &str = "TOOLRELAY_CONFIG";

/// File name searched for when walking upward from the working directory.
pub const CONFIG_FILE_NAME: &str = "toolrelay.yaml";

// ─── Public Types ────────────────────────────────────────────────────────────

/// How tool calls travel between the session and a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolProtocol {
    /// OpenAI `tools` / `tool_calls` fields.
    #[default]
    Native,
    /// Catalog in the system prompt, calls as `<ToolCall>` tags in the reply.
    Text,
}

/// A single backend service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// OpenAI-compatible base URL (the `/chat/completions` suffix is appended).
    pub base_url: String,
    pub model: String,
    /// Sent as a bearer token when present and non-empty.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default)]
    pub tool_protocol: ToolProtocol,
    /// Overrides `generation.temperature` for this service.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Overrides `generation.max_tokens` for this service.
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Generation defaults applied when neither the request nor the service sets a value.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: None,
            max_tokens: default_max_tokens(),
        }
    }
}

/// Conversation session settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Upper bound on backend requests per `send`.
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_hops: default_max_hops(),
        }
    }
}

/// Failover controller settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FailoverConfig {
    /// Service to start with (defaults to the first one).
    #[serde(default)]
    pub initial_service: Option<String>,
    /// Attempt budget per service; the total budget is this times the service count.
    #[serde(default = "default_attempts_per_service")]
    pub attempts_per_service: usize,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            initial_service: None,
            attempts_per_service: default_attempts_per_service(),
        }
    }
}

/// Top-level configuration (mirrors `toolrelay.yaml`).
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
}

fn default_true() -> bool {
    true
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_max_hops() -> usize {
    25
}
fn default_attempts_per_service() -> usize {
    3
}

impl RelayConfig {
    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.services.is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "at least one service must be configured".into(),
            });
        }

        let mut names = HashSet::new();
        for service in &self.services {
            if service.name.trim().is_empty() {
                return Err(InferenceError::ConfigError {
                    reason: "service name must not be empty".into(),
                });
            }
            if !names.insert(service.name.as_str()) {
                return Err(InferenceError::ConfigError {
                    reason: format!("duplicate service name '{}'", service.name),
                });
            }
            if service.base_url.trim().is_empty() {
                return Err(InferenceError::ConfigError {
                    reason: format!("service '{}' has an empty base_url", service.name),
                });
            }
        }

        if let Some(initial) = &self.failover.initial_service {
            if !names.contains(initial.as_str()) {
                return Err(InferenceError::ConfigError {
                    reason: format!("initial service '{initial}' not found in services"),
                });
            }
        }

        if self.session.max_hops == 0 {
            return Err(InferenceError::ConfigError {
                reason: "session.max_hops must be at least 1".into(),
            });
        }
        if self.failover.attempts_per_service == 0 {
            return Err(InferenceError::ConfigError {
                reason: "failover.attempts_per_service must be at least 1".into(),
            });
        }

        Ok(())
    }

    /// Index of the service failover starts with.
    pub fn initial_service_index(&self) -> usize {
        self.failover
            .initial_service
            .as_ref()
            .and_then(|name| self.services.iter().position(|s| &s.name == name))
            .unwrap_or(0)
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `TOOLRELAY_CONFIG` first, then searches upward from `start` for
/// `toolrelay.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, InferenceError> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points to a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(InferenceError::ConfigError {
        reason: format!("could not find {CONFIG_FILE_NAME}"),
    })
}

/// Load, interpolate, parse and validate a config file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_config(path: &Path) -> Result<RelayConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let config = parse_config(&raw)?;
    tracing::info!(
        path = %path.display(),
        services = config.services.len(),
        "loaded service configuration"
    );
    Ok(config)
}

/// Parse and validate config text.
pub fn parse_config(raw: &str) -> Result<RelayConfig, InferenceError> {
    let interpolated = interpolate_env_vars(raw);

    let config: RelayConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    config.validate()?;
    Ok(config)
}

/// Find and load the config starting from the current working directory.
pub fn load_default_config() -> Result<RelayConfig, InferenceError> {
    let cwd = std::env::current_dir().map_err(|e| InferenceError::ConfigError {
        reason: format!("cannot determine working directory: {e}"),
    })?;
    load_config(&find_config_path(&cwd)?)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
