use chrono::{DateTime, Duration, Utc};
use libsql::{Row, params};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_timestamp, to_rfc3339};

const JOB_COLUMNS: &str = "id, organization_id, mailbox_id, type, status, run_at, attempts, max_attempts, locked_at, locked_by, last_error, dedupe_key, payload, created_at, updated_at";

pub const DEFAULT_MAX_ATTEMPTS: i64 = 25;
const BACKOFF_CAP_SECONDS: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub organization_id: Option<String>,
    pub mailbox_id: Option<String>,
    pub job_type: String,
    pub status: JobStatus,
    pub run_at: DateTime<Utc>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub dedupe_key: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("payload json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("invalid job status value {0}")]
    InvalidStatus(String),
}

#[derive(Clone)]
pub struct JobQueue {
    db: Database,
}

impl JobQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Enqueue a job. With a dedupe key the insert is idempotent while a
    /// prior job with the same (organization, type, key) is still queued or
    /// running: the duplicate is dropped and `None` is returned.
    pub async fn enqueue(
        &self,
        job_type: &str,
        organization_id: Option<&str>,
        mailbox_id: Option<&str>,
        payload: Value,
        dedupe_key: Option<String>,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<Option<String>, QueueError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        // Canonical JSON: compact, sorted keys.
        let payload_json = serde_json::to_string(&payload)?;
        let run_at = run_at.map(to_rfc3339).unwrap_or_else(|| now.clone());

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "INSERT OR IGNORE INTO bg_jobs (id, organization_id, mailbox_id, type, status, run_at, attempts, max_attempts, dedupe_key, payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'queued', ?5, 0, ?6, ?7, ?8, ?9, ?9)
                 RETURNING id",
                params![
                    id,
                    organization_id.map(|s| s.to_string()),
                    mailbox_id.map(|s| s.to_string()),
                    job_type,
                    run_at,
                    DEFAULT_MAX_ATTEMPTS,
                    dedupe_key,
                    payload_json,
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Atomically claim the oldest due job. The selection and the move to
    /// `running` happen in one statement, so concurrent workers never claim
    /// the same row.
    pub async fn claim_one(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE bg_jobs
                     SET status = 'running', locked_at = ?2, locked_by = ?3, updated_at = ?2
                     WHERE id = (
                         SELECT id FROM bg_jobs
                         WHERE status = 'queued' AND run_at <= ?1
                         ORDER BY run_at ASC
                         LIMIT 1
                     )
                     RETURNING {JOB_COLUMNS}"
                ),
                params![now.clone(), now.clone(), worker_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_job(row)?)),
            None => Ok(None),
        }
    }

    pub async fn mark_succeeded(&self, job_id: &str) -> Result<(), QueueError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "UPDATE bg_jobs SET status = 'succeeded', updated_at = ?2 WHERE id = ?1",
            params![job_id, now_rfc3339()],
        )
        .await?;
        Ok(())
    }

    /// Record a failure. Permanent failures (or exhausted attempts) move the
    /// job to `failed`; otherwise it requeues with exponential backoff.
    /// Returns the status the job ended in.
    pub async fn mark_failed(
        &self,
        job_id: &str,
        error: &str,
        permanent: bool,
    ) -> Result<JobStatus, QueueError> {
        let job = self.fetch_job(job_id).await?;
        let attempts = job.attempts + 1;
        let now = now_rfc3339();
        let conn = self.db.connection().await?;

        if permanent || attempts >= job.max_attempts {
            conn.execute(
                "UPDATE bg_jobs SET status = 'failed', attempts = ?2, last_error = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![job_id, attempts, error, now],
            )
            .await?;
            return Ok(JobStatus::Failed);
        }

        let backoff = backoff_seconds(attempts);
        let run_at = Utc::now() + Duration::milliseconds((backoff * 1000.0) as i64);
        conn.execute(
            "UPDATE bg_jobs SET status = 'queued', attempts = ?2, last_error = ?3, run_at = ?4, updated_at = ?5
             WHERE id = ?1",
            params![job_id, attempts, error, to_rfc3339(run_at), now],
        )
        .await?;
        Ok(JobStatus::Queued)
    }

    pub async fn cancel(&self, job_id: &str) -> Result<(), QueueError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "UPDATE bg_jobs SET status = 'cancelled', updated_at = ?2
             WHERE id = ?1 AND status IN ('queued', 'running')",
            params![job_id, now_rfc3339()],
        )
        .await?;
        Ok(())
    }

    pub async fn fetch_job(&self, job_id: &str) -> Result<Job, QueueError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM bg_jobs WHERE id = ?1"),
                params![job_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_to_job(row),
            None => Err(QueueError::JobNotFound(job_id.to_string())),
        }
    }
}

/// `min(60s, 0.5 * 2^min(attempts, 8))`
fn backoff_seconds(attempts: i64) -> f64 {
    let exponent = attempts.clamp(0, 8) as u32;
    (0.5 * f64::from(2u32.pow(exponent))).min(BACKOFF_CAP_SECONDS)
}

fn row_to_job(row: Row) -> Result<Job, QueueError> {
    let status_raw: String = row.get(4)?;
    let status = JobStatus::from_str(&status_raw)
        .ok_or_else(|| QueueError::InvalidStatus(status_raw))?;
    let payload_json: String = row.get(12)?;

    Ok(Job {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        mailbox_id: row.get(2)?,
        job_type: row.get(3)?,
        status,
        run_at: parse_timestamp(row.get(5)?)
            .ok_or_else(|| QueueError::InvalidStatus("run_at".into()))?,
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        locked_at: parse_timestamp(row.get(8)?),
        locked_by: row.get(9)?,
        last_error: row.get(10)?,
        dedupe_key: row.get(11)?,
        payload: serde_json::from_str(&payload_json)?,
        created_at: parse_timestamp(row.get(13)?)
            .ok_or_else(|| QueueError::InvalidStatus("created_at".into()))?,
        updated_at: parse_timestamp(row.get(14)?)
            .ok_or_else(|| QueueError::InvalidStatus("updated_at".into()))?,
    })
}
