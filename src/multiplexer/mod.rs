//! Terminal multiplexer abstraction.
//!
//! The orchestrator depends on a multiplexer only through the
//! [`Multiplexer`] trait so terminal-mode sessions can be exercised
//! without a real tmux server.

pub mod tmux;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use crate::Result;

pub use tmux::Tmux;

/// Request to create a detached multiplexer session.
#[derive(Debug, Clone)]
pub struct DetachedSession {
    /// Full (prefixed) session name.
    pub name: String,
    /// Shell command run in the first pane.
    pub command: String,
    /// Working directory.
    pub cwd: PathBuf,
    /// Environment passed to the command.
    pub env: BTreeMap<String, String>,
    /// Window width.
    pub width: u16,
    /// Window height.
    pub height: u16,
}

/// Terminal multiplexer operations used by the session lifecycle.
pub trait Multiplexer: Send + Sync {
    /// Namespaced session name for `task_name`.
    fn session_name(&self, task_name: &str) -> String;

    /// Whether the named session exists.
    fn session_exists(&self, name: &str) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;

    /// Whether the session exists and its pane process is still running.
    fn pane_alive(&self, name: &str) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;

    /// Create a detached session and return the pane process id.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Multiplexer`](crate::AppError::Multiplexer) if
    /// the session cannot be created.
    fn create_detached_session(
        &self,
        request: DetachedSession,
    ) -> Pin<Box<dyn Future<Output = Result<u32>> + Send + '_>>;

    /// Kill the named session. Missing sessions are ignored.
    fn kill_session(&self, name: &str) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Attach the caller's terminal to the session and return its exit code.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Multiplexer`](crate::AppError::Multiplexer) if
    /// the multiplexer cannot be launched.
    fn attach(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<i32>> + Send + '_>>;

    /// Names of every session carrying this multiplexer's prefix.
    fn list_sessions(&self) -> Pin<Box<dyn Future<Output = Vec<String>> + Send + '_>>;
}

/// Quote `value` for a POSIX shell.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return value.to_owned();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// `KEY=value ... command` with every value shell-quoted.
#[must_use]
pub fn inline_env_command(env: &BTreeMap<String, String>, command: &str) -> String {
    if env.is_empty() {
        return command.to_owned();
    }
    let exports: Vec<String> = env
        .iter()
        .map(|(k, v)| format!("{k}={}", shell_quote(v)))
        .collect();
    format!("{} {command}", exports.join(" "))
}
