//! `tmux` implementation of [`Multiplexer`].

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{inline_env_command, DetachedSession, Multiplexer};
use crate::config::MultiplexerConfig;
use crate::{AppError, Result};

/// Drives a local tmux server through its command line.
#[derive(Debug, Clone)]
pub struct Tmux {
    binary: String,
    prefix: String,
}

impl Tmux {
    /// Create a driver from configuration.
    #[must_use]
    pub fn new(config: &MultiplexerConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            prefix: config.prefix.clone(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    async fn output(&self, args: &[&str]) -> Result<std::process::Output> {
        self.command()
            .args(args)
            .output()
            .await
            .map_err(|err| AppError::Multiplexer(format!("failed to run {}: {err}", self.binary)))
    }
}

/// Exact-match target so `loop-a` never matches `loop-ab`.
fn target(name: &str) -> String {
    format!("={name}")
}

impl Multiplexer for Tmux {
    fn session_name(&self, task_name: &str) -> String {
        format!("{}{task_name}", self.prefix)
    }

    fn session_exists(&self, name: &str) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let target = target(name);
        Box::pin(async move {
            self.output(&["has-session", "-t", &target])
                .await
                .is_ok_and(|out| out.status.success())
        })
    }

    fn pane_alive(&self, name: &str) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let target = target(name);
        Box::pin(async move {
            match self
                .output(&["list-panes", "-t", &target, "-F", "#{pane_dead}"])
                .await
            {
                Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                    .lines()
                    .any(|line| line.trim() == "0"),
                _ => false,
            }
        })
    }

    fn create_detached_session(
        &self,
        request: DetachedSession,
    ) -> Pin<Box<dyn Future<Output = Result<u32>> + Send + '_>> {
        Box::pin(async move {
            let shell_cmd = inline_env_command(&request.env, &request.command);
            let cwd = request.cwd.to_string_lossy().into_owned();
            let width = request.width.to_string();
            let height = request.height.to_string();

            let out = self
                .output(&[
                    "new-session",
                    "-d",
                    "-P",
                    "-F",
                    "#{pane_pid}",
                    "-s",
                    &request.name,
                    "-c",
                    &cwd,
                    "-x",
                    &width,
                    "-y",
                    &height,
                    &shell_cmd,
                ])
                .await?;
            if !out.status.success() {
                return Err(AppError::Multiplexer(format!(
                    "new-session {} failed: {}",
                    request.name,
                    String::from_utf8_lossy(&out.stderr).trim()
                )));
            }

            // Keep the pane after exit so crash output stays visible.
            let target = target(&request.name);
            match self
                .output(&["set-option", "-t", &target, "remain-on-exit", "on"])
                .await
            {
                Ok(o) if o.status.success() => {}
                _ => warn!(session = %request.name, "failed to set remain-on-exit"),
            }

            let pid = String::from_utf8_lossy(&out.stdout)
                .trim()
                .parse::<u32>()
                .map_err(|err| {
                    AppError::Multiplexer(format!("unparseable pane pid for {}: {err}", request.name))
                })?;
            info!(session = %request.name, pid, "multiplexer session created");
            Ok(pid)
        })
    }

    fn kill_session(&self, name: &str) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let target = target(name);
        Box::pin(async move {
            match self.output(&["kill-session", "-t", &target]).await {
                Ok(out) if out.status.success() => debug!(target = %target, "session killed"),
                Ok(_) => debug!(target = %target, "no session to kill"),
                Err(err) => warn!(%err, "kill-session failed"),
            }
        })
    }

    fn attach(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<i32>> + Send + '_>> {
        let name = name.to_owned();
        Box::pin(async move {
            let status = Command::new(&self.binary)
                .args(["attach-session", "-t", &name])
                .status()
                .await
                .map_err(|err| AppError::Multiplexer(format!("attach failed: {err}")))?;
            Ok(status.code().unwrap_or(1))
        })
    }

    fn list_sessions(&self) -> Pin<Box<dyn Future<Output = Vec<String>> + Send + '_>> {
        Box::pin(async move {
            match self.output(&["list-sessions", "-F", "#{session_name}"]).await {
                Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                    .lines()
                    .filter(|name| name.starts_with(&self.prefix))
                    .map(str::to_owned)
                    .collect(),
                _ => Vec::new(),
            }
        })
    }
}
