//! `SQLite` schema bootstrap and additive migrations.
//!
//! The table definition uses `CREATE TABLE IF NOT EXISTS`, safe to re-run
//! on every startup. Columns introduced after the first release are added
//! by [`migrate`] so registries written by older builds stay readable.

use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::Result;

/// Optional columns and the definition used when adding them.
const ADDITIVE_COLUMNS: &[(&str, &str)] = &[
    ("execution_mode", "TEXT NOT NULL DEFAULT 'terminal'"),
    ("transport", "TEXT NOT NULL DEFAULT 'local'"),
    ("server_port", "INTEGER"),
    ("server_url", "TEXT"),
    ("agent_session_id", "TEXT"),
    ("overlay_service_name", "TEXT"),
    ("overlay_identity_path", "TEXT"),
    ("remote_host", "TEXT"),
];

/// Create the `sessions` table if missing and apply additive migrations.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS sessions (
    task_name       TEXT PRIMARY KEY NOT NULL,
    task_dir        TEXT NOT NULL,
    pid             INTEGER,
    agent           TEXT NOT NULL,
    status          TEXT NOT NULL,
    started_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    iteration       INTEGER NOT NULL DEFAULT 0,
    max_iterations  INTEGER NOT NULL DEFAULT 0,
    current_story   TEXT
);
";
    sqlx::raw_sql(ddl).execute(pool).await?;
    migrate(pool).await
}

/// Add every column from [`ADDITIVE_COLUMNS`] that the table lacks.
///
/// # Errors
///
/// Returns `AppError::Db` if introspection or an `ALTER TABLE` fails.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    let existing: Vec<(String,)> = sqlx::query_as("SELECT name FROM pragma_table_info('sessions')")
        .fetch_all(pool)
        .await?;

    for (column, definition) in ADDITIVE_COLUMNS {
        if existing.iter().any(|(name,)| name == column) {
            continue;
        }
        if add_column(pool, column, definition).await? {
            info!(column, "registry column added");
        }
    }

    Ok(())
}

/// Add one column to `sessions`. Returns `false` when the column already
/// exists, which happens when another process migrated the same registry
/// between our introspection and the `ALTER TABLE`.
///
/// # Errors
///
/// Returns `AppError::Db` for any other failure.
pub async fn add_column(pool: &SqlitePool, column: &str, definition: &str) -> Result<bool> {
    let stmt = format!("ALTER TABLE sessions ADD COLUMN {column} {definition}");
    match sqlx::query(&stmt).execute(pool).await {
        Ok(_) => Ok(true),
        Err(sqlx::Error::Database(err)) if err.message().contains("duplicate column name") => {
            debug!(column, "column added concurrently");
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}
