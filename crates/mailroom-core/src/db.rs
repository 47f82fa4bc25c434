use std::{path::Path, sync::Arc};

use libsql::{Builder, Connection, Database as LibSqlDatabase};
use thiserror::Error;

/// Busy handler window for connections. Several worker processes share one
/// database file, and the claim UPDATE serializes on the writer lock; a
/// blocked claim waits instead of surfacing SQLITE_BUSY to the queue.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Handle to the embedded database file. Mailroom is single-node: every
/// worker process opens the same local file under `paths.database`.
#[derive(Clone)]
pub struct Database {
    inner: Arc<LibSqlDatabase>,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to create database directory: {0}")]
    CreateDir(std::io::Error),
    #[error("failed to open database: {0}")]
    Open(libsql::Error),
    #[error("failed to open connection: {0}")]
    Connect(libsql::Error),
    #[error("failed to execute statement: {0}")]
    Statement(libsql::Error),
}

impl Database {
    /// Open the database file, creating its data directory on first run.
    pub async fn open(database_path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let inner = Builder::new_local(database_path.to_string_lossy().to_string())
            .build()
            .await
            .map_err(DbError::Open)?;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub async fn connection(&self) -> Result<Connection, DbError> {
        let conn = self.inner.connect().map_err(DbError::Connect)?;
        configure_connection(&conn).await?;
        Ok(conn)
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        let conn = self.connection().await?;
        let mut rows = conn
            .query("SELECT 1", ())
            .await
            .map_err(DbError::Statement)?;
        let _ = rows.next().await.map_err(DbError::Statement)?;
        Ok(())
    }
}

/// Every connection enforces foreign keys and waits out writer contention.
async fn configure_connection(conn: &Connection) -> Result<(), DbError> {
    conn.execute("PRAGMA foreign_keys = ON", ())
        .await
        .map_err(DbError::Statement)?;

    // busy_timeout answers with the applied value; drain the row.
    let mut rows = conn
        .query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ())
        .await
        .map_err(DbError::Statement)?;
    let _ = rows.next().await.map_err(DbError::Statement)?;
    Ok(())
}

// Timestamps are stored as RFC3339 TEXT (millis, UTC). The fixed format keeps
// lexicographic ordering equal to chronological ordering, which the queue's
// `run_at <= now` comparisons rely on.
pub(crate) fn now_rfc3339() -> String {
    to_rfc3339(chrono::Utc::now())
}

pub(crate) fn to_rfc3339(dt: chrono::DateTime<chrono::Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(
    value: Option<String>,
) -> Option<chrono::DateTime<chrono::Utc>> {
    value.and_then(|raw| {
        chrono::DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|dt| dt.with_timezone(&chrono::Utc))
    })
}
