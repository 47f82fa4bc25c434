//! Forward-only schema migrations. Each entry pairs a version slug with the
//! SQL shipped under `migrations/`; applied versions are recorded in
//! `schema_migrations` with mailroom's RFC3339 timestamps. Downgrades are
//! not supported.

use std::collections::HashSet;

use libsql::{Connection, params};
use thiserror::Error;
use tracing::info;

use crate::db::{Database, DbError, now_rfc3339};

static MIGRATIONS: &[(&str, &str)] = &[(
    "001_initial",
    include_str!("../../../migrations/001_initial.sql"),
)];

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("migration failed: {0}")]
    LibSql(#[from] libsql::Error),
}

/// Bring the database up to the current schema. Returns how many migrations
/// were applied; zero means the schema was already current.
pub async fn run_migrations(db: &Database) -> Result<usize, MigrationError> {
    let conn = db.connection().await?;
    apply_pending(&conn, MIGRATIONS).await
}

async fn apply_pending(
    conn: &Connection,
    migrations: &[(&str, &str)],
) -> Result<usize, MigrationError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version TEXT PRIMARY KEY, applied_at TEXT NOT NULL)",
        (),
    )
    .await?;

    let applied = applied_versions(conn).await?;
    let mut newly_applied = 0;

    for (version, sql) in migrations {
        if applied.contains(*version) {
            continue;
        }

        // Schema change and version stamp land together or not at all.
        let tx = conn.transaction().await?;
        tx.execute_batch(sql).await?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![*version, now_rfc3339()],
        )
        .await?;
        tx.commit().await?;

        info!(version = *version, "applied schema migration");
        newly_applied += 1;
    }

    Ok(newly_applied)
}

async fn applied_versions(conn: &Connection) -> Result<HashSet<String>, MigrationError> {
    let mut versions = HashSet::new();
    let mut rows = conn
        .query("SELECT version FROM schema_migrations", ())
        .await?;
    while let Some(row) = rows.next().await? {
        versions.insert(row.get::<String>(0)?);
    }
    Ok(versions)
}
