//! Signal file model.
//!
//! A signal file is a one-shot marker the loop driver reads and deletes
//! between iterations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of interruption requested.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Stop after the current step.
    Stop,
    /// Pause cleanly after the current iteration.
    Checkpoint,
}

/// Contents of `<signals>/<task>.signal`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signal {
    /// Requested interruption.
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// When the request was written.
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    /// Build a signal stamped with the current time.
    #[must_use]
    pub fn now(kind: SignalKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }
}
