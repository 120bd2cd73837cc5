//! Callbacks from control methods into the loop driver.

use std::fmt::Debug;

use tracing::warn;

use crate::models::signal::SignalKind;
use crate::orchestrator::signals::SignalStore;

/// Side effects of control requests. All methods default to no-ops and
/// must not block.
pub trait LoopHooks: Send + Sync + Debug {
    /// A client asked the loop to stop.
    fn on_stop(&self) {}

    /// A client asked for a checkpoint.
    fn on_checkpoint(&self) {}

    /// Interactive mode toggled.
    fn on_interactive_mode(&self, _enabled: bool) {}

    /// Raw terminal input forwarded while interactive.
    fn on_write_pty(&self, _data: &str) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl LoopHooks for NoopHooks {}

/// Hooks that turn stop and checkpoint requests into signal files the
/// driver polls between iterations.
#[derive(Debug, Clone)]
pub struct SignalFileHooks {
    store: SignalStore,
    task_name: String,
}

impl SignalFileHooks {
    /// Hooks writing signals for `task_name` into `store`.
    #[must_use]
    pub fn new(store: SignalStore, task_name: impl Into<String>) -> Self {
        Self {
            store,
            task_name: task_name.into(),
        }
    }

    fn write(&self, kind: SignalKind) {
        if let Err(err) = self.store.write(&self.task_name, kind) {
            warn!(task = %self.task_name, ?kind, %err, "failed to write signal file");
        }
    }
}

impl LoopHooks for SignalFileHooks {
    fn on_stop(&self) {
        self.write(SignalKind::Stop);
    }

    fn on_checkpoint(&self) {
        self.write(SignalKind::Checkpoint);
    }
}
