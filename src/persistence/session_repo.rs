//! Session registry backed by `SQLite`.
//!
//! One row per task name. Every mutation is a single statement so that
//! the daemon and independent CLI invocations can share the file safely.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::models::session::{
    ExecutionMode, OverlayInfo, ServerInfo, SessionRecord, SessionStatus, Transport,
};
use crate::{AppError, Result};

use super::db::Database;

/// Confirms that a `running` local session is actually alive.
///
/// Implemented by the orchestrator over the terminal multiplexer and the
/// agent-server health endpoint.
pub trait LivenessProbe: Send + Sync {
    /// Return `true` if the process or transport backing `record` is alive.
    fn is_alive<'a>(
        &'a self,
        record: &'a SessionRecord,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

const SELECT_COLUMNS: &str = "task_name, task_dir, pid, agent, status, started_at, updated_at, \
     iteration, max_iterations, current_story, execution_mode, transport, server_port, \
     server_url, agent_session_id, overlay_service_name, overlay_identity_path, remote_host";

/// Registry of session records.
#[derive(Clone)]
pub struct SessionRegistry {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    task_name: String,
    task_dir: String,
    pid: Option<i64>,
    agent: String,
    status: String,
    started_at: String,
    updated_at: String,
    iteration: Option<i64>,
    max_iterations: Option<i64>,
    current_story: Option<String>,
    execution_mode: Option<String>,
    transport: Option<String>,
    server_port: Option<i64>,
    server_url: Option<String>,
    agent_session_id: Option<String>,
    overlay_service_name: Option<String>,
    overlay_identity_path: Option<String>,
    remote_host: Option<String>,
}

impl SessionRow {
    fn into_record(self) -> Result<SessionRecord> {
        let status = SessionStatus::parse(&self.status)
            .ok_or_else(|| AppError::Db(format!("invalid session status: {}", self.status)))?;

        Ok(SessionRecord {
            task_name: self.task_name,
            task_dir: self.task_dir,
            worker_pid: self.pid.and_then(|p| u32::try_from(p).ok()),
            agent: self.agent,
            status,
            execution_mode: self
                .execution_mode
                .as_deref()
                .map_or(ExecutionMode::Terminal, ExecutionMode::parse_or_default),
            transport: self
                .transport
                .as_deref()
                .map_or(Transport::Local, Transport::parse_or_default),
            iteration: to_u32(self.iteration),
            max_iterations: to_u32(self.max_iterations),
            current_story: self.current_story,
            server: ServerInfo {
                port: self.server_port.and_then(|p| u16::try_from(p).ok()),
                url: self.server_url,
                agent_session_id: self.agent_session_id,
            },
            overlay: OverlayInfo {
                service_name: self.overlay_service_name,
                identity_path: self.overlay_identity_path,
                remote_host: self.remote_host,
            },
            started_at: parse_timestamp(&self.started_at, "started_at")?,
            updated_at: parse_timestamp(&self.updated_at, "updated_at")?,
        })
    }
}

fn to_u32(value: Option<i64>) -> u32 {
    value.and_then(|v| u32::try_from(v).ok()).unwrap_or(0)
}

fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

impl SessionRegistry {
    /// Create a new registry over `db`.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace the record for `record.task_name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the upsert fails.
    pub async fn register(&self, record: &SessionRecord) -> Result<()> {
        self.upsert(record, false).await.map(|_| ())
    }

    /// Upsert `record` only if the stored row for the task is not `running`.
    ///
    /// Callers reconcile the existing record first; this closes the window
    /// between that check and the write when another process races.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionAlreadyRunning` if a `running` row exists,
    /// or `AppError::Db` if the statement fails.
    pub async fn claim_running(&self, record: &SessionRecord) -> Result<()> {
        if self.upsert(record, true).await? == 0 {
            return Err(AppError::SessionAlreadyRunning(record.task_name.clone()));
        }
        Ok(())
    }

    async fn upsert(&self, record: &SessionRecord, unless_running: bool) -> Result<u64> {
        let guard = if unless_running {
            " WHERE sessions.status != 'running'"
        } else {
            ""
        };
        let stmt = format!(
            "INSERT INTO sessions (task_name, task_dir, pid, agent, status, started_at, updated_at,
                 iteration, max_iterations, current_story, execution_mode, transport, server_port,
                 server_url, agent_session_id, overlay_service_name, overlay_identity_path, remote_host)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
             ON CONFLICT(task_name) DO UPDATE SET
                 task_dir = excluded.task_dir,
                 pid = excluded.pid,
                 agent = excluded.agent,
                 status = excluded.status,
                 started_at = excluded.started_at,
                 updated_at = excluded.updated_at,
                 iteration = excluded.iteration,
                 max_iterations = excluded.max_iterations,
                 current_story = excluded.current_story,
                 execution_mode = excluded.execution_mode,
                 transport = excluded.transport,
                 server_port = excluded.server_port,
                 server_url = excluded.server_url,
                 agent_session_id = excluded.agent_session_id,
                 overlay_service_name = excluded.overlay_service_name,
                 overlay_identity_path = excluded.overlay_identity_path,
                 remote_host = excluded.remote_host{guard}"
        );

        let result = sqlx::query(&stmt)
            .bind(&record.task_name)
            .bind(&record.task_dir)
            .bind(record.worker_pid.map(i64::from))
            .bind(&record.agent)
            .bind(record.status.as_str())
            .bind(record.started_at.to_rfc3339())
            .bind(Utc::now().to_rfc3339())
            .bind(i64::from(record.iteration))
            .bind(i64::from(record.max_iterations))
            .bind(&record.current_story)
            .bind(record.execution_mode.as_str())
            .bind(record.transport.as_str())
            .bind(record.server.port.map(i64::from))
            .bind(&record.server.url)
            .bind(&record.server.agent_session_id)
            .bind(&record.overlay.service_name)
            .bind(&record.overlay.identity_path)
            .bind(&record.overlay.remote_host)
            .execute(self.db.as_ref())
            .await?;

        Ok(result.rows_affected())
    }

    /// Fetch the record for `task_name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or the row is corrupt.
    pub async fn get(&self, task_name: &str) -> Result<Option<SessionRecord>> {
        let stmt = format!("SELECT {SELECT_COLUMNS} FROM sessions WHERE task_name = ?1");
        let row: Option<SessionRow> = sqlx::query_as(&stmt)
            .bind(task_name)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(SessionRow::into_record).transpose()
    }

    /// All records, newest start first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_all(&self) -> Result<Vec<SessionRecord>> {
        let stmt = format!("SELECT {SELECT_COLUMNS} FROM sessions ORDER BY started_at DESC");
        let rows: Vec<SessionRow> = sqlx::query_as(&stmt)
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter().map(SessionRow::into_record).collect()
    }

    /// Records reachable over the overlay network.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_remote(&self) -> Result<Vec<SessionRecord>> {
        let stmt = format!(
            "SELECT {SELECT_COLUMNS} FROM sessions WHERE transport = 'overlay' ORDER BY started_at DESC"
        );
        let rows: Vec<SessionRow> = sqlx::query_as(&stmt)
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter().map(SessionRow::into_record).collect()
    }

    /// Records still `running` after liveness reconciliation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a query or demotion fails.
    pub async fn list_running(&self, probe: &dyn LivenessProbe) -> Result<Vec<SessionRecord>> {
        let mut running = Vec::new();
        for record in self.list_all().await? {
            if !record.is_running() {
                continue;
            }
            let record = self.reconcile_liveness(record, probe).await?;
            if record.is_running() {
                running.push(record);
            }
        }
        Ok(running)
    }

    /// Set the status of `task_name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such record exists, or
    /// `AppError::Db` if the update fails.
    pub async fn update_status(&self, task_name: &str, status: SessionStatus) -> Result<()> {
        let result =
            sqlx::query("UPDATE sessions SET status = ?1, updated_at = ?2 WHERE task_name = ?3")
                .bind(status.as_str())
                .bind(Utc::now().to_rfc3339())
                .bind(task_name)
                .execute(self.db.as_ref())
                .await?;
        ensure_touched(result.rows_affected(), task_name)
    }

    /// Advance progress counters. The iteration never moves backwards.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such record exists, or
    /// `AppError::Db` if the update fails.
    pub async fn update_progress(
        &self,
        task_name: &str,
        iteration: u32,
        current_story: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sessions
             SET iteration = MAX(iteration, ?1), current_story = ?2, updated_at = ?3
             WHERE task_name = ?4",
        )
        .bind(i64::from(iteration))
        .bind(current_story)
        .bind(Utc::now().to_rfc3339())
        .bind(task_name)
        .execute(self.db.as_ref())
        .await?;
        ensure_touched(result.rows_affected(), task_name)
    }

    /// Record the agent server's own session id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such record exists, or
    /// `AppError::Db` if the update fails.
    pub async fn update_agent_session_id(&self, task_name: &str, id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sessions SET agent_session_id = ?1, updated_at = ?2 WHERE task_name = ?3",
        )
        .bind(id)
        .bind(Utc::now().to_rfc3339())
        .bind(task_name)
        .execute(self.db.as_ref())
        .await?;
        ensure_touched(result.rows_affected(), task_name)
    }

    /// Record the loop driver's process id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such record exists, or
    /// `AppError::Db` if the update fails.
    pub async fn update_worker_pid(&self, task_name: &str, pid: u32) -> Result<()> {
        let result =
            sqlx::query("UPDATE sessions SET pid = ?1, updated_at = ?2 WHERE task_name = ?3")
                .bind(i64::from(pid))
                .bind(Utc::now().to_rfc3339())
                .bind(task_name)
                .execute(self.db.as_ref())
                .await?;
        ensure_touched(result.rows_affected(), task_name)
    }

    /// Confirm a `running` local record against live state.
    ///
    /// Non-running and overlay records are returned unchanged. A running
    /// local record whose probe fails is demoted to `failed`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the demotion fails.
    pub async fn reconcile_liveness(
        &self,
        mut record: SessionRecord,
        probe: &dyn LivenessProbe,
    ) -> Result<SessionRecord> {
        if !record.is_running() || !record.kind().is_local() {
            return Ok(record);
        }
        if probe.is_alive(&record).await {
            return Ok(record);
        }

        warn!(
            task_name = %record.task_name,
            mode = record.execution_mode.as_str(),
            "running session failed liveness check, marking failed"
        );
        let now = Utc::now();
        sqlx::query(
            "UPDATE sessions SET status = 'failed', updated_at = ?1
             WHERE task_name = ?2 AND status = 'running'",
        )
        .bind(now.to_rfc3339())
        .bind(&record.task_name)
        .execute(self.db.as_ref())
        .await?;

        record.status = SessionStatus::Failed;
        record.updated_at = now;
        Ok(record)
    }

    /// Apply a status reported by the daemon hosting an overlay session.
    ///
    /// Local records and unknown tasks are ignored. Returns the record as
    /// stored afterwards.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a query fails.
    pub async fn reconcile_remote(
        &self,
        task_name: &str,
        remote_status: SessionStatus,
    ) -> Result<Option<SessionRecord>> {
        let Some(record) = self.get(task_name).await? else {
            return Ok(None);
        };
        if record.transport != Transport::Overlay || record.status == remote_status {
            return Ok(Some(record));
        }
        info!(
            task_name,
            from = record.status.as_str(),
            to = remote_status.as_str(),
            "reconciled remote session status"
        );
        self.update_status(task_name, remote_status).await?;
        self.get(task_name).await
    }

    /// Delete the record for `task_name`. Returns whether a row existed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn remove(&self, task_name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE task_name = ?1")
            .bind(task_name)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete non-running records last updated before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge_terminal(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM sessions WHERE status != 'running' AND updated_at < ?1")
                .bind(cutoff.to_rfc3339())
                .execute(self.db.as_ref())
                .await?;
        Ok(result.rows_affected())
    }
}

fn ensure_touched(rows: u64, task_name: &str) -> Result<()> {
    if rows == 0 {
        Err(AppError::NotFound(format!("session '{task_name}' not found")))
    } else {
        Ok(())
    }
}
