//! Retention service for time-based purge of finished session records.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::session_repo::SessionRegistry;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Spawn the retention purge background task.
///
/// The task runs hourly. On each tick it deletes records that are not
/// `running` and have not changed for longer than `retention_days`.
#[must_use]
pub fn spawn_retention_task(
    registry: SessionRegistry,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(err) = purge(&registry, retention_days).await {
                        error!(?err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Run one purge pass and return the number of deleted records.
///
/// # Errors
///
/// Returns `AppError::Db` if the delete fails.
pub async fn purge(registry: &SessionRegistry, retention_days: u32) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    let purged = registry.purge_terminal(cutoff).await?;
    info!(retention_days, purged, "retention purge completed");
    Ok(purged)
}
