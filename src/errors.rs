//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Control socket or local IPC failure.
    Ipc(String),
    /// HTTP transport failure talking to an agent server.
    Http(String),
    /// Overlay identity, bind, or dial failure.
    Overlay(String),
    /// Terminal multiplexer command failure.
    Multiplexer(String),
    /// Malformed message on a JSON-RPC stream.
    Protocol(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// A `running` session already exists for the named task.
    SessionAlreadyRunning(String),
    /// An instance or service with the same key already exists.
    AlreadyExists(String),
    /// Every port in the configured range is taken.
    NoPortsAvailable(String),
    /// The agent-server process could not be spawned.
    ServerStart(String),
    /// The agent-server process never became healthy.
    ServerHealthCheck(String),
    /// Agent session operation failed or has no backing instance.
    Session(String),
    /// File-system or I/O operation failure.
    Io(String),
}

/// Coarse classification used for retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad identity, credentials, or missing binaries.
    Configuration,
    /// Timeouts or refused connections.
    TransientNetwork,
    /// Session already running, instance already exists, service already bound.
    StateConflict,
    /// Malformed RPC input.
    Protocol,
    /// No free ports.
    ResourceExhausted,
    /// Agent-server exited or failed to come up.
    ProcessFailure,
    /// Durable storage failure.
    Storage,
    /// Unknown task or instance.
    NotFound,
}

impl AppError {
    /// Classify this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) | Self::Multiplexer(_) => ErrorCategory::Configuration,
            Self::Http(_) | Self::Overlay(_) | Self::Ipc(_) | Self::Io(_) => {
                ErrorCategory::TransientNetwork
            }
            Self::SessionAlreadyRunning(_) | Self::AlreadyExists(_) => ErrorCategory::StateConflict,
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::NoPortsAvailable(_) => ErrorCategory::ResourceExhausted,
            Self::ServerStart(_) | Self::ServerHealthCheck(_) | Self::Session(_) => {
                ErrorCategory::ProcessFailure
            }
            Self::Db(_) => ErrorCategory::Storage,
            Self::NotFound(_) => ErrorCategory::NotFound,
        }
    }

    /// Whether a long-running polling context may retry after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::TransientNetwork
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Http(msg) => write!(f, "http: {msg}"),
            Self::Overlay(msg) => write!(f, "overlay: {msg}"),
            Self::Multiplexer(msg) => write!(f, "multiplexer: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::SessionAlreadyRunning(task) => {
                write!(f, "session already running for task '{task}'")
            }
            Self::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            Self::NoPortsAvailable(msg) => write!(f, "no ports available: {msg}"),
            Self::ServerStart(msg) => write!(f, "server start: {msg}"),
            Self::ServerHealthCheck(msg) => write!(f, "server health check: {msg}"),
            Self::Session(msg) => write!(f, "session: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
