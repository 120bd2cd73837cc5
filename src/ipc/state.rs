//! Session state exposed over the control socket.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

/// Ring buffer of recent output lines. Oldest lines fall off first.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputBuffer {
    /// Buffer holding at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Lines currently held, oldest first.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Number of lines held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Partial update applied by the loop driver. `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    /// Current iteration.
    pub iteration: Option<i64>,
    /// Story being worked on.
    pub current_story: Option<String>,
    /// Lifecycle status.
    pub status: Option<String>,
    /// Iteration cap.
    pub max_iterations: Option<i64>,
}

/// Live state of one loop, owned by its control server.
#[derive(Debug, Clone)]
pub struct RpcSessionState {
    /// Task name.
    pub task_name: String,
    /// Task directory.
    pub task_dir: String,
    /// Agent identifier.
    pub agent: String,
    /// Current iteration.
    pub iteration: i64,
    /// Iteration cap.
    pub max_iterations: i64,
    /// Story being worked on.
    pub current_story: Option<String>,
    /// Lifecycle status.
    pub status: String,
    /// Whether a human is steering the agent directly.
    pub interactive_mode: bool,
    /// Prompt queued by `inject_prompt`, consumed by the driver.
    pub injected_prompt: Option<String>,
    /// Creation time.
    pub started_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
    /// Recent output.
    pub output: OutputBuffer,
}

impl RpcSessionState {
    /// Fresh `running` state at iteration zero.
    #[must_use]
    pub fn new(
        task_name: impl Into<String>,
        task_dir: impl Into<String>,
        agent: impl Into<String>,
        max_iterations: i64,
        output_capacity: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_name: task_name.into(),
            task_dir: task_dir.into(),
            agent: agent.into(),
            iteration: 0,
            max_iterations,
            current_story: None,
            status: "running".into(),
            interactive_mode: false,
            injected_prompt: None,
            started_at: now,
            updated_at: now,
            output: OutputBuffer::new(output_capacity),
        }
    }

    /// `interactive` or `autonomous`.
    #[must_use]
    pub fn mode_indicator(&self) -> &'static str {
        if self.interactive_mode {
            "interactive"
        } else {
            "autonomous"
        }
    }

    /// Apply `update` and return the fields that actually changed.
    ///
    /// `updated_at` moves only when the diff is non-empty.
    pub fn apply(&mut self, update: StateUpdate) -> Map<String, Value> {
        let mut changed = Map::new();
        if let Some(iteration) = update.iteration {
            if iteration != self.iteration {
                self.iteration = iteration;
                changed.insert("iteration".into(), json!(iteration));
            }
        }
        if let Some(story) = update.current_story {
            if self.current_story.as_deref() != Some(story.as_str()) {
                changed.insert("current_story".into(), json!(story));
                self.current_story = Some(story);
            }
        }
        if let Some(status) = update.status {
            if status != self.status {
                changed.insert("status".into(), json!(status));
                self.status = status;
            }
        }
        if let Some(max) = update.max_iterations {
            if max != self.max_iterations {
                self.max_iterations = max;
                changed.insert("max_iterations".into(), json!(max));
            }
        }
        if !changed.is_empty() {
            self.updated_at = Utc::now();
        }
        changed
    }

    /// `get_status` payload.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({
            "task_name": self.task_name,
            "task_dir": self.task_dir,
            "iteration": self.iteration,
            "max_iterations": self.max_iterations,
            "current_story": self.current_story,
            "agent": self.agent,
            "status": self.status,
            "interactive_mode": self.interactive_mode,
            "mode_indicator": self.mode_indicator(),
            "started_at": self.started_at.to_rfc3339(),
            "updated_at": self.updated_at.to_rfc3339(),
            "recent_output": self.output.lines(),
        })
    }
}
