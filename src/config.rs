//! Global configuration parsing, validation, and credential loading.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{AppError, Result};

/// Keyring service name used for agent-server credentials.
pub const KEYRING_SERVICE: &str = "agent-loopd";

/// Inclusive TCP port range handed out to agent-server instances.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PortRange {
    /// First port considered.
    #[serde(default = "default_port_start")]
    pub start: u16,
    /// Last port considered (inclusive).
    #[serde(default = "default_port_end")]
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
        }
    }
}

fn default_port_start() -> u16 {
    4096
}

fn default_port_end() -> u16 {
    5096
}

/// Timeouts for health checks, HTTP calls, and shutdown escalation.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Total time allowed for a new agent server to report healthy.
    #[serde(default = "default_health_check_seconds")]
    pub health_check_seconds: u64,
    /// Delay between health probes.
    #[serde(default = "default_health_interval_millis")]
    pub health_interval_millis: u64,
    /// Timeout of a single health probe.
    #[serde(default = "default_health_probe_seconds")]
    pub health_probe_seconds: u64,
    /// Timeout for ordinary agent-server HTTP calls.
    #[serde(default = "default_http_seconds")]
    pub http_seconds: u64,
    /// Timeout for the best-effort abort issued before termination.
    #[serde(default = "default_abort_seconds")]
    pub abort_seconds: u64,
    /// Wait after SIGTERM before escalating.
    #[serde(default = "default_stop_seconds")]
    pub stop_seconds: u64,
    /// Wait after SIGKILL before giving up on the process.
    #[serde(default = "default_kill_seconds")]
    pub kill_seconds: u64,
    /// Wait for in-flight proxy connections during service shutdown.
    #[serde(default = "default_proxy_drain_seconds")]
    pub proxy_drain_seconds: u64,
    /// Upper bound for each stage of daemon shutdown.
    #[serde(default = "default_shutdown_stage_seconds")]
    pub shutdown_stage_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            health_check_seconds: default_health_check_seconds(),
            health_interval_millis: default_health_interval_millis(),
            health_probe_seconds: default_health_probe_seconds(),
            http_seconds: default_http_seconds(),
            abort_seconds: default_abort_seconds(),
            stop_seconds: default_stop_seconds(),
            kill_seconds: default_kill_seconds(),
            proxy_drain_seconds: default_proxy_drain_seconds(),
            shutdown_stage_seconds: default_shutdown_stage_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// Health-check deadline.
    #[must_use]
    pub fn health_check(&self) -> Duration {
        Duration::from_secs(self.health_check_seconds)
    }

    /// Health poll interval.
    #[must_use]
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_millis)
    }

    /// Single health probe timeout.
    #[must_use]
    pub fn health_probe(&self) -> Duration {
        Duration::from_secs(self.health_probe_seconds)
    }

    /// Ordinary HTTP call timeout.
    #[must_use]
    pub fn http(&self) -> Duration {
        Duration::from_secs(self.http_seconds)
    }

    /// Abort call timeout.
    #[must_use]
    pub fn abort(&self) -> Duration {
        Duration::from_secs(self.abort_seconds)
    }

    /// Graceful termination wait.
    #[must_use]
    pub fn stop(&self) -> Duration {
        Duration::from_secs(self.stop_seconds)
    }

    /// Forced kill wait.
    #[must_use]
    pub fn kill(&self) -> Duration {
        Duration::from_secs(self.kill_seconds)
    }

    /// Proxy drain wait.
    #[must_use]
    pub fn proxy_drain(&self) -> Duration {
        Duration::from_secs(self.proxy_drain_seconds)
    }

    /// Daemon shutdown stage bound.
    #[must_use]
    pub fn shutdown_stage(&self) -> Duration {
        Duration::from_secs(self.shutdown_stage_seconds)
    }
}

fn default_health_check_seconds() -> u64 {
    30
}

fn default_health_interval_millis() -> u64 {
    500
}

fn default_health_probe_seconds() -> u64 {
    2
}

fn default_http_seconds() -> u64 {
    30
}

fn default_abort_seconds() -> u64 {
    5
}

fn default_stop_seconds() -> u64 {
    10
}

fn default_kill_seconds() -> u64 {
    5
}

fn default_proxy_drain_seconds() -> u64 {
    5
}

fn default_shutdown_stage_seconds() -> u64 {
    15
}

/// Outcome a permission rule assigns to matching tool calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionAction {
    /// Run without asking.
    Allow,
    /// Refuse.
    Deny,
    /// Ask the operator.
    Ask,
}

/// One entry of the ruleset sent when creating an agent session.
///
/// Rules are applied in order by the agent server; a later rule overrides
/// an earlier one that matches the same call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PermissionRule {
    /// Permission name or `*`.
    pub permission: String,
    /// Glob pattern the permission applies to.
    pub pattern: String,
    /// Resulting action.
    pub action: PermissionAction,
}

impl PermissionRule {
    fn allow(permission: &str, pattern: &str) -> Self {
        Self {
            permission: permission.to_owned(),
            pattern: pattern.to_owned(),
            action: PermissionAction::Allow,
        }
    }
}

fn default_permissions() -> Vec<PermissionRule> {
    vec![
        PermissionRule::allow("*", "*"),
        PermissionRule::allow("external_directory", "*"),
        PermissionRule::allow("doom_loop", "*"),
    ]
}

/// Agent-server process settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentServerConfig {
    /// Executable launched for each instance.
    #[serde(default = "default_agent_binary")]
    pub binary: String,
    /// Arguments placed before `--port`/`--hostname`.
    #[serde(default = "default_serve_args")]
    pub serve_args: Vec<String>,
    /// Arguments placed before the server URL when attaching.
    #[serde(default = "default_attach_args")]
    pub attach_args: Vec<String>,
    /// Model passed with `--model`.
    #[serde(default)]
    pub model: Option<String>,
    /// Enable debug logging on the agent server.
    #[serde(default)]
    pub verbose: bool,
    /// Skip permission prompts inside the agent server.
    #[serde(default = "default_true")]
    pub yolo_mode: bool,
    /// Environment variable set when `yolo_mode` is on.
    #[serde(default = "default_permission_env")]
    pub permission_env: String,
    /// Manager-level environment overrides.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Credential names resolved through the keychain (or upper-cased env
    /// vars) and injected into every instance environment.
    #[serde(default)]
    pub credential_keys: Vec<String>,
    /// Optional basic-auth password for the agent-server HTTP API.
    #[serde(default)]
    pub password: Option<String>,
    /// Ordered permission ruleset sent at session creation.
    #[serde(default = "default_permissions")]
    pub permissions: Vec<PermissionRule>,
}

impl Default for AgentServerConfig {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            serve_args: default_serve_args(),
            attach_args: default_attach_args(),
            model: None,
            verbose: false,
            yolo_mode: true,
            permission_env: default_permission_env(),
            env: HashMap::new(),
            credential_keys: Vec::new(),
            password: None,
            permissions: default_permissions(),
        }
    }
}

fn default_agent_binary() -> String {
    "opencode".into()
}

fn default_serve_args() -> Vec<String> {
    vec!["serve".into()]
}

fn default_attach_args() -> Vec<String> {
    vec!["attach".into()]
}

fn default_permission_env() -> String {
    "OPENCODE_PERMISSION".into()
}

fn default_true() -> bool {
    true
}

/// Terminal multiplexer settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MultiplexerConfig {
    /// Multiplexer executable.
    #[serde(default = "default_mux_binary")]
    pub binary: String,
    /// Prefix applied to every session name.
    #[serde(default = "default_mux_prefix")]
    pub prefix: String,
    /// Detached window width.
    #[serde(default = "default_mux_width")]
    pub width: u16,
    /// Detached window height.
    #[serde(default = "default_mux_height")]
    pub height: u16,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            binary: default_mux_binary(),
            prefix: default_mux_prefix(),
            width: default_mux_width(),
            height: default_mux_height(),
        }
    }
}

fn default_mux_binary() -> String {
    "tmux".into()
}

fn default_mux_prefix() -> String {
    "loop-".into()
}

fn default_mux_width() -> u16 {
    200
}

fn default_mux_height() -> u16 {
    50
}

/// Overlay network settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct OverlayConfig {
    /// Bind the control service and per-session proxies.
    #[serde(default)]
    pub enabled: bool,
    /// Credential file identifying this host on the overlay.
    #[serde(default)]
    pub identity_path: Option<PathBuf>,
    /// Host name used in the control service name.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Prefix of the per-host control service.
    #[serde(default = "default_control_prefix")]
    pub control_service_prefix: String,
    /// Prefix of per-session proxy services.
    #[serde(default = "default_loop_prefix")]
    pub loop_service_prefix: String,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            identity_path: None,
            hostname: None,
            control_service_prefix: default_control_prefix(),
            loop_service_prefix: default_loop_prefix(),
        }
    }
}

impl OverlayConfig {
    /// Effective host name, falling back to `HOSTNAME` then `localhost`.
    #[must_use]
    pub fn effective_hostname(&self) -> String {
        self.hostname
            .clone()
            .or_else(|| env::var("HOSTNAME").ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".into())
    }

    /// Deterministic control service name for `hostname`.
    #[must_use]
    pub fn control_service_name(&self, hostname: &str) -> String {
        format!("{}{hostname}", self.control_service_prefix)
    }
}

fn default_control_prefix() -> String {
    "loop-control-".into()
}

fn default_loop_prefix() -> String {
    "loop-session-".into()
}

/// Control socket settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RpcConfig {
    /// Lines of recent output retained per session.
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,
    /// Pending outbound messages per subscriber before it is dropped.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
    /// Longest accepted request line.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            output_buffer: default_output_buffer(),
            subscriber_queue: default_subscriber_queue(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

fn default_output_buffer() -> usize {
    200
}

fn default_subscriber_queue() -> usize {
    256
}

fn default_max_line_bytes() -> usize {
    1024 * 1024
}

/// External loop driver launched for sessions.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DriverConfig {
    /// Driver executable; unset disables daemon-launched drivers.
    #[serde(default)]
    pub binary: Option<String>,
    /// Arguments placed before the task directory.
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_retention_days() -> u32 {
    30
}

fn default_data_dir() -> PathBuf {
    env::var_os("HOME")
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join(".local")
        .join("share")
        .join("agent-loopd")
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Root for the registry database, sockets, and signal files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Port range for agent-server instances.
    #[serde(default)]
    pub ports: PortRange,
    /// Timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Agent-server launch settings.
    #[serde(default)]
    pub agent_server: AgentServerConfig,
    /// Terminal multiplexer settings.
    #[serde(default)]
    pub multiplexer: MultiplexerConfig,
    /// Overlay network settings.
    #[serde(default)]
    pub overlay: OverlayConfig,
    /// Control socket settings.
    #[serde(default)]
    pub rpc: RpcConfig,
    /// Loop driver launched for sessions.
    #[serde(default)]
    pub driver: DriverConfig,
    /// Days before finished session records are purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            ports: PortRange::default(),
            timeouts: TimeoutConfig::default(),
            agent_server: AgentServerConfig::default(),
            multiplexer: MultiplexerConfig::default(),
            overlay: OverlayConfig::default(),
            rpc: RpcConfig::default(),
            driver: DriverConfig::default(),
            retention_days: default_retention_days(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the `SQLite` registry.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("sessions.db")
    }

    /// Directory holding per-session control sockets.
    #[must_use]
    pub fn sockets_dir(&self) -> PathBuf {
        self.data_dir.join("sockets")
    }

    /// Control socket path for `task_name`.
    #[must_use]
    pub fn socket_path(&self, task_name: &str) -> PathBuf {
        self.sockets_dir().join(format!("{task_name}.sock"))
    }

    /// Directory holding signal files.
    #[must_use]
    pub fn signals_dir(&self) -> PathBuf {
        self.data_dir.join("signals")
    }

    /// Resolve configured credentials from the OS keychain with env-var
    /// fallback. Missing credentials are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the keychain task cannot be joined.
    pub async fn load_credentials(&self) -> Result<HashMap<String, String>> {
        let mut resolved = HashMap::new();
        for key in &self.agent_server.credential_keys {
            let env_key = key.to_uppercase();
            match load_credential(key, &env_key).await {
                Ok(value) => {
                    resolved.insert(env_key, value);
                }
                Err(AppError::Config(msg)) if msg.contains("not found") => {
                    warn!(key = %key, "credential unavailable, instances start without it");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(resolved)
    }

    fn validate(&self) -> Result<()> {
        if self.ports.start == 0 {
            return Err(AppError::Config("ports.start must be greater than zero".into()));
        }
        if self.ports.start > self.ports.end {
            return Err(AppError::Config(format!(
                "ports.start ({}) must not exceed ports.end ({})",
                self.ports.start, self.ports.end
            )));
        }
        if self.agent_server.binary.trim().is_empty() {
            return Err(AppError::Config("agent_server.binary must not be empty".into()));
        }
        if self.rpc.output_buffer == 0 || self.rpc.subscriber_queue == 0 {
            return Err(AppError::Config(
                "rpc.output_buffer and rpc.subscriber_queue must be greater than zero".into(),
            ));
        }
        if self.overlay.enabled && self.overlay.identity_path.is_none() {
            return Err(AppError::Config(
                "overlay.identity_path is required when overlay is enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<String> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    env::var(env_key).map_err(|_| {
        AppError::Config(format!(
            "credential {keyring_key} not found in keychain or {env_key} env var"
        ))
    })
}
