//! Public types consumed by the host.
//!
//! The host constructs [`LspConfig`], receives [`LspEvent`]s, and reads
//! [`DiagnosticsSnapshot`]s for display. Positions crossing this boundary are
//! 1-based ([`HostPosition`]); the wire is 0-based.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the LSP client subsystem.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LspConfig {
    /// Whether the LSP client is enabled. Default: false.
    #[serde(default)]
    pub enabled: bool,
    /// Per-language server configurations, keyed by name (e.g. "rust").
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    /// Engine tunables shared by every session.
    #[serde(default)]
    pub session: SessionSettings,
}

impl LspConfig {
    #[must_use]
    pub fn servers(&self) -> &HashMap<String, ServerConfig> {
        &self.servers
    }
}

/// Configuration for a single language server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Executable command (e.g. "rust-analyzer").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the server process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// LSP language identifier (e.g. "rust", "python").
    pub language_id: String,
    /// Glob patterns of files this server handles (e.g. `["**/*.rs"]`).
    #[serde(default)]
    pub file_patterns: Vec<String>,
    /// Files that indicate a workspace root (e.g. `["Cargo.toml"]`).
    #[serde(default)]
    pub root_markers: Vec<String>,
    /// Sent verbatim as `initializationOptions`.
    #[serde(default)]
    pub initialization_options: Option<serde_json::Value>,
}

impl ServerConfig {
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    #[must_use]
    pub fn file_patterns(&self) -> &[String] {
        &self.file_patterns
    }
}

const fn default_write_failure_threshold() -> u32 {
    5
}
const fn default_hitrate_ceiling() -> u32 {
    24
}
const fn default_resend_interval_ms() -> u64 {
    1_000
}
const fn default_init_resend_interval_ms() -> u64 {
    10_000
}
const fn default_init_max_sends() -> u32 {
    3
}
const fn default_raw_chunk_bytes() -> usize {
    16 * 1024
}
const fn default_read_budget_bytes() -> usize {
    256 * 1024
}
const fn default_idle_shutdown_secs() -> u64 {
    60
}
const fn default_restart_min_interval_secs() -> u64 {
    10
}

/// Tunables for session pacing and failure policy.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    /// Consecutive failed writes before a session is degraded.
    #[serde(default = "default_write_failure_threshold")]
    pub write_failure_threshold: u32,
    /// Non-whitelisted pushes allowed per second, per category.
    #[serde(default = "default_hitrate_ceiling")]
    pub hitrate_ceiling: u32,
    /// Time before an unanswered request is resent (or expired).
    #[serde(default = "default_resend_interval_ms")]
    pub resend_interval_ms: u64,
    /// Resend interval for `initialize`; servers can be slow to start.
    #[serde(default = "default_init_resend_interval_ms")]
    pub init_resend_interval_ms: u64,
    /// How many times `initialize` may be written before giving up.
    #[serde(default = "default_init_max_sends")]
    pub init_max_sends: u32,
    /// Bytes of a raw payload written per tick.
    #[serde(default = "default_raw_chunk_bytes")]
    pub raw_chunk_bytes: usize,
    /// Maximum bytes read from the server's stdout per tick.
    #[serde(default = "default_read_budget_bytes")]
    pub read_budget_bytes: usize,
    /// Idle time after the last matching document closes before exit.
    #[serde(default = "default_idle_shutdown_secs")]
    pub idle_shutdown_secs: u64,
    /// Minimum time between automatic restarts of the same server.
    #[serde(default = "default_restart_min_interval_secs")]
    pub restart_min_interval_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            write_failure_threshold: default_write_failure_threshold(),
            hitrate_ceiling: default_hitrate_ceiling(),
            resend_interval_ms: default_resend_interval_ms(),
            init_resend_interval_ms: default_init_resend_interval_ms(),
            init_max_sends: default_init_max_sends(),
            raw_chunk_bytes: default_raw_chunk_bytes(),
            read_budget_bytes: default_read_budget_bytes(),
            idle_shutdown_secs: default_idle_shutdown_secs(),
            restart_min_interval_secs: default_restart_min_interval_secs(),
        }
    }
}

impl SessionSettings {
    #[must_use]
    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    #[must_use]
    pub fn init_resend_interval(&self) -> Duration {
        Duration::from_millis(self.init_resend_interval_ms)
    }

    #[must_use]
    pub fn idle_shutdown(&self) -> Duration {
        Duration::from_secs(self.idle_shutdown_secs)
    }

    #[must_use]
    pub fn restart_min_interval(&self) -> Duration {
        Duration::from_secs(self.restart_min_interval_secs)
    }
}

/// A 1-based line/column position as used by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostPosition {
    pub line: u32,
    pub col: u32,
}

impl HostPosition {
    #[must_use]
    pub const fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

/// An incremental edit reported by the host, in 1-based positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEdit {
    pub start: HostPosition,
    pub end: HostPosition,
    pub text: String,
}

impl DocumentEdit {
    #[must_use]
    pub fn new(start: HostPosition, end: HostPosition, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the LSP-defined range.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// A single diagnostic from a language server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    severity: DiagnosticSeverity,
    message: String,
    /// 0-indexed line number.
    line: u32,
    /// 0-indexed column.
    col: u32,
    /// Source of the diagnostic (e.g. "rustc", "clippy").
    source: String,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        severity: DiagnosticSeverity,
        message: String,
        line: u32,
        col: u32,
        source: String,
    ) -> Self {
        Self {
            severity,
            message,
            line,
            col,
            source,
        }
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 0-indexed line number.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// 0-indexed column.
    #[must_use]
    pub fn col(&self) -> u32 {
        self.col
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Format as `path:line:col: severity: [source] message` (1-indexed for display).
    #[must_use]
    pub fn display_with_path(&self, path: &Path) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            path.display(),
            self.line + 1,
            self.col + 1,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

/// Invalid server configuration, caught when the manager is built.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("server '{server}': invalid file pattern '{pattern}': {source}")]
    InvalidPattern {
        server: String,
        pattern: String,
        source: globset::Error,
    },
    #[error("server '{server}': command is empty")]
    EmptyCommand { server: String },
}

/// Why a session stopped on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStopReason {
    /// The process is no longer running.
    Exited,
    /// Too many consecutive write failures.
    WriteFailures(u32),
    /// The inbound byte stream could not be framed.
    Protocol(String),
    /// `initialize` failed or was never answered.
    InitFailed(String),
}

impl fmt::Display for ServerStopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited => write!(f, "process exited"),
            Self::WriteFailures(n) => write!(f, "{n} consecutive write failures"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::InitFailed(msg) => write!(f, "initialize failed: {msg}"),
        }
    }
}

/// An event emitted by a session.
#[derive(Debug, Clone)]
pub enum LspEvent {
    /// The server answered `initialize` and the session is ready.
    Initialized { server: String },
    /// Diagnostics updated for a file.
    Diagnostics {
        server: String,
        path: PathBuf,
        items: Vec<Diagnostic>,
    },
    /// The session degraded; the host decides whether to restart it.
    ServerStopped {
        server: String,
        reason: ServerStopReason,
    },
}

impl LspEvent {
    pub const INITIALIZED: &'static str = "initialized";
    pub const DIAGNOSTICS: &'static str = "diagnostics";
    pub const SHUTDOWN: &'static str = "shutdown";

    /// Name under which event listeners are registered.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialized { .. } => Self::INITIALIZED,
            Self::Diagnostics { .. } => Self::DIAGNOSTICS,
            Self::ServerStopped { .. } => Self::SHUTDOWN,
        }
    }
}

/// Immutable snapshot of all diagnostics, suitable for display.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    /// Per-file diagnostics, sorted with error-containing files first.
    files: Vec<(PathBuf, Vec<Diagnostic>)>,
}

impl DiagnosticsSnapshot {
    pub(crate) fn new(files: Vec<(PathBuf, Vec<Diagnostic>)>) -> Self {
        Self { files }
    }

    /// Per-file diagnostics, sorted with error-containing files first.
    #[must_use]
    pub fn files(&self) -> &[(PathBuf, Vec<Diagnostic>)] {
        &self.files
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.files
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.files.iter().map(|(_, items)| items.len()).sum()
    }

    /// Format a compact status string like "E:3 W:5".
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}
