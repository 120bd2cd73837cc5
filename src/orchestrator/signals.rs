//! Signal files: one-shot stop/checkpoint markers read by the loop driver.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::models::signal::{Signal, SignalKind};
use crate::{AppError, Result};

/// Directory of `<task>.signal` files.
#[derive(Debug, Clone)]
pub struct SignalStore {
    dir: PathBuf,
}

impl SignalStore {
    /// Store rooted at `dir`; created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the signal file for `task_name`.
    #[must_use]
    pub fn path(&self, task_name: &str) -> PathBuf {
        self.dir.join(format!("{task_name}.signal"))
    }

    /// Atomically replace the pending signal for `task_name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory or file cannot be written.
    pub fn write(&self, task_name: &str, kind: SignalKind) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_vec(&Signal::now(kind))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&body)?;
        tmp.persist(self.path(task_name))
            .map_err(|err| AppError::Io(format!("failed to persist signal: {err}")))?;
        debug!(task_name, ?kind, "signal written");
        Ok(())
    }

    /// Read and delete the pending signal. Missing or malformed files
    /// yield `None`; a malformed file is removed.
    #[must_use]
    pub fn take(&self, task_name: &str) -> Option<Signal> {
        let path = self.path(task_name);
        let raw = fs::read(&path).ok()?;
        remove_quietly(&path);
        match serde_json::from_slice(&raw) {
            Ok(signal) => Some(signal),
            Err(err) => {
                warn!(task_name, %err, "discarding malformed signal file");
                None
            }
        }
    }

    /// Remove any pending signal for `task_name`.
    pub fn clear(&self, task_name: &str) {
        remove_quietly(&self.path(task_name));
    }
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), %err, "failed to remove signal file");
        }
    }
}
