//! toolrelay — LLM conversations with tool calling over any backend.
//!
//! - [`inference`]: backend adapters, the `<ToolCall>` text protocol, config
//! - [`agent_core`]: the multi-hop tool dispatch session and rate-limit failover

pub mod agent_core;
pub mod inference;

use std::path::{Path, PathBuf};

pub use agent_core::{
    AgentError, ConversationSession, FailoverController, FailoverState, SessionOptions, Tool,
    ToolRegistry,
};
pub use inference::{
    BackendAdapter, ChatRequest, InferenceError, Message, RelayConfig, StreamEvent, StreamHandle,
    ToolCall, ToolSpec,
};

/// Default log filter when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "toolrelay=info,warn";

/// Log file name inside the log directory.
const LOG_FILE_NAME: &str = "toolrelay.log";

/// Rotated log files kept next to the current one.
const LOG_FILES_KEPT: u32 = 3;

/// Return the platform-standard data directory for toolrelay.
///
/// - macOS: `~/Library/Application Support/toolrelay/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolrelay\`
/// - Linux: `$XDG_DATA_HOME/toolrelay/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.toolrelay/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolrelay");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolrelay")
}

/// Where and how [`init_tracing`] writes logs.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Write to a rotated `toolrelay.log` in this directory instead of stderr.
    /// `Some(data_dir())` gives the platform default.
    pub log_dir: Option<PathBuf>,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

/// Initialize the tracing subscriber.
///
/// With a log directory:
/// 1. Rotates existing logs (toolrelay.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh toolrelay.log with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the log path for discoverability.
///
/// Returns the log file path, if any. Calling this twice is harmless: the
/// second subscriber is not installed.
pub fn init_tracing(options: &LogOptions) -> std::io::Result<Option<PathBuf>> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let (writer, log_path, ansi) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let log_path = dir.join(LOG_FILE_NAME);
            rotate_log_file(&log_path, LOG_FILES_KEPT);

            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?;
            (
                BoxMakeWriter::new(FlushingWriter::new(log_file)),
                Some(log_path),
                false,
            )
        }
        None => (BoxMakeWriter::new(std::io::stderr), None, true),
    };

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if options.json {
        builder.json().try_init().is_ok()
    } else {
        builder.with_ansi(ansi).try_init().is_ok()
    };

    if installed {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
            pid = std::process::id(),
            "toolrelay logging initialized"
        );
    }

    Ok(log_path)
}

/// Rotate log files: `toolrelay.log` → `toolrelay.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    // Delete the oldest
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    // Shift: .{n-1} → .{n}
    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    // Current → .1
    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Without explicit flushing, log entries may sit in OS buffers and be lost
/// on crash.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
