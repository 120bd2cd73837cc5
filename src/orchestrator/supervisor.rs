//! Child process supervision: spawn, health-check, and escalating stop.
//!
//! Knows nothing about agent servers. A process is spawned in its own
//! process group so that termination reaches every descendant, polled
//! over HTTP until healthy, and stopped with SIGTERM followed by SIGKILL.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use crate::{AppError, Result};

/// Characters of stderr kept when a process dies during startup.
const STDERR_CAPTURE_LIMIT: usize = 500;

/// Everything needed to launch a supervised process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Executable.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Variables added on top of the inherited environment, in order.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub cwd: PathBuf,
}

/// A running child under supervision.
#[derive(Debug)]
pub struct SupervisedProcess {
    child: Child,
    pid: Option<u32>,
    stderr: Option<ChildStderr>,
}

impl SupervisedProcess {
    /// OS process id, if the process was started.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status if the process has already exited.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Whether the process is still running.
    pub fn is_running(&mut self) -> bool {
        self.try_exit_status().is_none()
    }

    /// Wait for the process to exit.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the exit status cannot be collected.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Forward remaining stderr output to the debug log so the pipe never
    /// fills up while the process runs.
    pub fn drain_stderr(&mut self, label: String) {
        if let Some(stderr) = self.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(process = %label, "{line}");
                }
            });
        }
    }

    async fn captured_stderr(&mut self) -> String {
        let Some(mut stderr) = self.stderr.take() else {
            return String::new();
        };
        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(1), stderr.read_to_end(&mut buf)).await;
        if read.is_err() {
            debug!("timed out reading stderr of exited process");
        }
        String::from_utf8_lossy(&buf)
            .chars()
            .take(STDERR_CAPTURE_LIMIT)
            .collect()
    }
}

/// Health polling parameters.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Endpoint returning 200 when healthy.
    pub url: String,
    /// Total time allowed.
    pub timeout: Duration,
    /// Delay between probes.
    pub interval: Duration,
    /// Timeout of one probe.
    pub probe_timeout: Duration,
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The process had already exited.
    AlreadyExited,
    /// Exited after SIGTERM.
    Terminated,
    /// Needed SIGKILL.
    Killed,
    /// Still not reaped after SIGKILL and the forced wait.
    Unresponsive,
}

/// Signals the orchestrator delivers to processes it does not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// SIGINT.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// SIGKILL.
    Kill,
}

/// Generic start/health-check/stop state machine.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    http: reqwest::Client,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl ProcessSupervisor {
    /// Create a supervisor probing health with `http`.
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Launch `spec` in a new process group with piped stderr.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ServerStart` if the OS refuses to spawn it.
    pub fn spawn(&self, spec: &ProcessSpec) -> Result<SupervisedProcess> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::ServerStart(format!("failed to spawn {}: {err}", spec.program))
        })?;
        let pid = child.id();
        let stderr = child.stderr.take();

        info!(program = %spec.program, pid = pid.unwrap_or(0), "process spawned");
        Ok(SupervisedProcess { child, pid, stderr })
    }

    /// Single health probe; any transport error or non-200 is unhealthy.
    pub async fn probe(&self, url: &str, timeout: Duration) -> bool {
        match self.http.get(url).timeout(timeout).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }

    /// Poll `check.url` until healthy, the process exits, or time runs out.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ServerHealthCheck` with captured stderr if the
    /// process exits first, or naming the elapsed time and URL on timeout.
    pub async fn wait_healthy(
        &self,
        process: &mut SupervisedProcess,
        check: &HealthCheck,
    ) -> Result<()> {
        let started = Instant::now();
        let deadline = started + check.timeout;

        loop {
            if let Some(status) = process.try_exit_status() {
                let stderr = process.captured_stderr().await;
                return Err(AppError::ServerHealthCheck(format!(
                    "process exited during startup ({status}); stderr: {stderr}"
                )));
            }

            if self.probe(&check.url, check.probe_timeout).await {
                debug!(url = %check.url, elapsed_ms = started.elapsed().as_millis(), "healthy");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(AppError::ServerHealthCheck(format!(
                    "no healthy response from {} after {:.1}s",
                    check.url,
                    started.elapsed().as_secs_f64()
                )));
            }
            tokio::time::sleep(check.interval.min(deadline - now)).await;
        }
    }

    /// Stop a process: SIGTERM to its group, wait `stop_wait`, then SIGKILL
    /// and wait `kill_wait`. Never fails.
    pub async fn terminate(
        &self,
        process: &mut SupervisedProcess,
        stop_wait: Duration,
        kill_wait: Duration,
    ) -> ShutdownOutcome {
        if !process.is_running() {
            return ShutdownOutcome::AlreadyExited;
        }
        let Some(pid) = process.pid else {
            return ShutdownOutcome::AlreadyExited;
        };

        signal_group(pid, ProcessSignal::Terminate);
        if tokio::time::timeout(stop_wait, process.child.wait()).await.is_ok() {
            return ShutdownOutcome::Terminated;
        }

        warn!(pid, "process ignored SIGTERM, sending SIGKILL");
        signal_group(pid, ProcessSignal::Kill);
        if let Err(err) = process.child.start_kill() {
            debug!(pid, %err, "direct kill failed");
        }
        if tokio::time::timeout(kill_wait, process.child.wait()).await.is_ok() {
            ShutdownOutcome::Killed
        } else {
            warn!(pid, "process still alive after SIGKILL");
            ShutdownOutcome::Unresponsive
        }
    }
}

/// Environment layering: later maps override earlier ones.
#[must_use]
pub fn layer_env(layers: &[&HashMap<String, String>]) -> Vec<(String, String)> {
    let mut merged: HashMap<&str, &str> = HashMap::new();
    for layer in layers {
        for (key, value) in *layer {
            merged.insert(key, value);
        }
    }
    let mut env: Vec<(String, String)> = merged
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
    env.sort();
    env
}

/// Deliver `signal` to the process group led by `pid`. Errors are logged.
pub fn signal_group(pid: u32, signal: ProcessSignal) {
    #[cfg(unix)]
    {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            warn!(pid, "pid out of range");
            return;
        };
        if let Err(err) = killpg(Pid::from_raw(raw), to_nix(signal)) {
            debug!(pid, ?signal, %err, "process group signal failed");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
    }
}

/// Deliver `signal` to the single process `pid`. Returns whether it was sent.
pub fn signal_process(pid: u32, signal: ProcessSignal) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), to_nix(signal)) {
            Ok(()) => true,
            Err(err) => {
                debug!(pid, ?signal, %err, "signal delivery failed");
                false
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        false
    }
}

/// Whether a process with `pid` exists.
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        i32::try_from(pid).is_ok_and(|raw| kill(Pid::from_raw(raw), None).is_ok())
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(unix)]
fn to_nix(signal: ProcessSignal) -> nix::sys::signal::Signal {
    use nix::sys::signal::Signal;
    match signal {
        ProcessSignal::Interrupt => Signal::SIGINT,
        ProcessSignal::Terminate => Signal::SIGTERM,
        ProcessSignal::Kill => Signal::SIGKILL,
    }
}
