//! Session record model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a loop session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Loop is executing.
    Running,
    /// Stopped on request.
    Stopped,
    /// Loop finished its work.
    Completed,
    /// Loop or its backing process died.
    Failed,
    /// Paused cleanly after an iteration.
    Checkpointed,
}

impl SessionStatus {
    /// Storage and wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Checkpointed => "checkpointed",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "checkpointed" => Some(Self::Checkpointed),
            _ => None,
        }
    }
}

/// How the loop executes its agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Inside a detached terminal multiplexer session.
    Terminal,
    /// As a client of an HTTP agent server.
    AgentServer,
}

impl ExecutionMode {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::AgentServer => "agent-server",
        }
    }

    /// Parse the storage representation; unknown values default to terminal.
    #[must_use]
    pub fn parse_or_default(raw: &str) -> Self {
        if raw == "agent-server" {
            Self::AgentServer
        } else {
            Self::Terminal
        }
    }
}

/// Where the session is reachable from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// On this host.
    Local,
    /// Through the overlay network on a daemon host.
    Overlay,
}

impl Transport {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Overlay => "overlay",
        }
    }

    /// Parse the storage representation; unknown values default to local.
    #[must_use]
    pub fn parse_or_default(raw: &str) -> Self {
        if raw == "overlay" {
            Self::Overlay
        } else {
            Self::Local
        }
    }
}

/// Agent-server coordinates, present in `agent-server` mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerInfo {
    /// Loopback port of the agent server.
    pub port: Option<u16>,
    /// Base URL the session is reachable at.
    pub url: Option<String>,
    /// Session id assigned by the agent server.
    pub agent_session_id: Option<String>,
}

/// Overlay coordinates, present for `overlay` transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverlayInfo {
    /// Proxy service bound for this session.
    pub service_name: Option<String>,
    /// Identity file used to dial the service.
    pub identity_path: Option<String>,
    /// Daemon host running the session.
    pub remote_host: Option<String>,
}

/// Durable record for one task's session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    /// Primary key.
    pub task_name: String,
    /// Working directory of the task.
    pub task_dir: String,
    /// Process id of the loop driver, if known.
    pub worker_pid: Option<u32>,
    /// Coding agent driving the loop.
    pub agent: String,
    /// Current status.
    pub status: SessionStatus,
    /// Immutable after creation.
    pub execution_mode: ExecutionMode,
    /// Immutable after creation.
    pub transport: Transport,
    /// Completed iterations.
    pub iteration: u32,
    /// Iteration limit.
    pub max_iterations: u32,
    /// Story being worked on.
    pub current_story: Option<String>,
    /// Agent-server coordinates.
    pub server: ServerInfo,
    /// Overlay coordinates.
    pub overlay: OverlayInfo,
    /// When the session started.
    pub started_at: DateTime<Utc>,
    /// Last mutation.
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Construct a `running` record for a new local session.
    #[must_use]
    pub fn new(
        task_name: impl Into<String>,
        task_dir: impl Into<String>,
        agent: impl Into<String>,
        execution_mode: ExecutionMode,
        max_iterations: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_name: task_name.into(),
            task_dir: task_dir.into(),
            worker_pid: None,
            agent: agent.into(),
            status: SessionStatus::Running,
            execution_mode,
            transport: Transport::Local,
            iteration: 0,
            max_iterations,
            current_story: None,
            server: ServerInfo::default(),
            overlay: OverlayInfo::default(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Mark the record as reachable over the overlay network.
    #[must_use]
    pub fn with_overlay(mut self, overlay: OverlayInfo) -> Self {
        self.transport = Transport::Overlay;
        self.overlay = overlay;
        self
    }

    /// Attach agent-server coordinates.
    #[must_use]
    pub fn with_server(mut self, server: ServerInfo) -> Self {
        self.server = server;
        self
    }

    /// Dispatch key combining mode and transport.
    #[must_use]
    pub fn kind(&self) -> SessionKind {
        SessionKind::of(self.execution_mode, self.transport)
    }

    /// Whether the record is in the `running` state.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }
}

/// Tagged union over execution mode and transport used at every dispatch
/// point (start, stop, attach, status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Terminal mode on this host.
    LocalTerminal,
    /// Agent-server mode on this host.
    LocalAgentServer,
    /// Terminal mode on a remote host.
    OverlayTerminal,
    /// Agent-server mode on a remote host.
    OverlayAgentServer,
}

impl SessionKind {
    /// Combine the two record dimensions.
    #[must_use]
    pub fn of(mode: ExecutionMode, transport: Transport) -> Self {
        match (mode, transport) {
            (ExecutionMode::Terminal, Transport::Local) => Self::LocalTerminal,
            (ExecutionMode::AgentServer, Transport::Local) => Self::LocalAgentServer,
            (ExecutionMode::Terminal, Transport::Overlay) => Self::OverlayTerminal,
            (ExecutionMode::AgentServer, Transport::Overlay) => Self::OverlayAgentServer,
        }
    }

    /// Whether liveness can be checked from this host.
    #[must_use]
    pub fn is_local(self) -> bool {
        matches!(self, Self::LocalTerminal | Self::LocalAgentServer)
    }
}
