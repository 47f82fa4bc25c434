use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::jobs::{JOB_TYPE_MAILBOX_BACKFILL, JOB_TYPE_MAILBOX_HISTORY_SYNC};
use crate::mailboxes::{MailboxError, MailboxRepository};
use crate::queue::{Job, JobQueue, QueueError};
use crate::sync::enqueue_mailbox_history_sync;

/// Retryable sync failures at or past this attempt count trip the mailbox
/// circuit breaker.
const CIRCUIT_BREAKER_ATTEMPTS: i64 = 5;
const CIRCUIT_BREAKER_PAUSE: chrono::Duration = chrono::Duration::minutes(15);

#[derive(Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub history_poll_interval: Duration,
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            history_poll_interval: Duration::from_secs(30),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("mailbox error: {0}")]
    Mailbox(#[from] MailboxError),
}

/// Handler outcome classification: fatal errors never retry, everything
/// else requeues with backoff.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }

    fn message(&self) -> &str {
        match self {
            JobError::Retryable(message) | JobError::Fatal(message) => message,
        }
    }
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: Job) -> Result<(), JobError>;
}

/// Claim and finish at most one job. Returns whether a job was claimed, so
/// the caller knows when to sleep. Tests drive the worker through this
/// function one step at a time.
pub async fn run_one_job<E: JobExecutor>(
    db: &Database,
    queue: &JobQueue,
    executor: &E,
    config: &WorkerConfig,
) -> Result<bool, WorkerError> {
    let Some(job) = queue.claim_one(&config.worker_id).await? else {
        return Ok(false);
    };

    info!(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, "processing job");

    let result = AssertUnwindSafe(executor.execute(job.clone()))
        .catch_unwind()
        .await;

    let outcome = match result {
        Ok(Ok(())) => None,
        Ok(Err(job_err)) => Some(job_err),
        Err(panic) => {
            let message = if let Some(msg) = panic.downcast_ref::<&str>() {
                msg.to_string()
            } else if let Some(msg) = panic.downcast_ref::<String>() {
                msg.clone()
            } else {
                "job handler panicked".to_string()
            };
            warn!(job_id = %job.id, "job panicked: {message}");
            Some(JobError::Retryable(message))
        }
    };

    match outcome {
        None => {
            queue.mark_succeeded(&job.id).await?;
            info!(job_id = %job.id, "job succeeded");
            schedule_history_followup(queue, &job, config).await;
        }
        Some(JobError::Fatal(message)) => {
            queue.mark_failed(&job.id, &message, true).await?;
            warn!(job_id = %job.id, error = %message, "job failed permanently");
        }
        Some(JobError::Retryable(message)) => {
            if breaker_should_trip(&job) {
                trip_circuit_breaker(db, queue, &job, &message).await?;
            } else {
                queue.mark_failed(&job.id, &message, false).await?;
                warn!(job_id = %job.id, error = %message, "job failed and will retry");
            }
        }
    }

    Ok(true)
}

/// Single-threaded polling loop. Horizontal scaling happens by running more
/// worker processes; every claim is safe against concurrent workers.
pub async fn run_worker<E: JobExecutor>(
    db: Database,
    queue: JobQueue,
    executor: E,
    config: WorkerConfig,
    shutdown: CancellationToken,
) {
    info!(worker_id = %config.worker_id, "worker started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match run_one_job(&db, &queue, &executor, &config).await {
            Ok(true) => {}
            Ok(false) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(config.poll_interval) => {}
                }
            }
            Err(err) => {
                error!(error = %err, "worker iteration failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(config.poll_interval) => {}
                }
            }
        }
    }
    info!(worker_id = %config.worker_id, "worker shutdown complete");
}

fn is_mailbox_sync_job(job: &Job) -> bool {
    job.job_type == JOB_TYPE_MAILBOX_BACKFILL || job.job_type == JOB_TYPE_MAILBOX_HISTORY_SYNC
}

fn breaker_should_trip(job: &Job) -> bool {
    is_mailbox_sync_job(job)
        && job.mailbox_id.is_some()
        && job.organization_id.is_some()
        && job.attempts + 1 >= CIRCUIT_BREAKER_ATTEMPTS
}

/// Terminal failure plus a 15 minute ingestion pause; paused mailboxes are
/// hard-skipped by the sync orchestrator until the window passes.
async fn trip_circuit_breaker(
    db: &Database,
    queue: &JobQueue,
    job: &Job,
    message: &str,
) -> Result<(), WorkerError> {
    queue.mark_failed(&job.id, message, true).await?;

    let (Some(organization_id), Some(mailbox_id)) =
        (job.organization_id.as_deref(), job.mailbox_id.as_deref())
    else {
        return Ok(());
    };

    let attempts = job.attempts + 1;
    let reason = format!(
        "Auto-paused by sync circuit breaker after {attempts} failed {} attempts",
        job.job_type
    );
    let mailboxes = MailboxRepository::new(db.clone());
    mailboxes
        .pause_ingestion(
            organization_id,
            mailbox_id,
            Utc::now() + CIRCUIT_BREAKER_PAUSE,
            &reason,
        )
        .await?;
    mailboxes
        .record_sync_error(organization_id, mailbox_id, message)
        .await?;

    warn!(
        job_id = %job.id,
        mailbox_id = %mailbox_id,
        attempts,
        "circuit breaker paused mailbox ingestion"
    );
    Ok(())
}

/// Keep history polling alive: a successful history sync schedules the next
/// one. The shared dedupe key guarantees at most one live follow-up.
async fn schedule_history_followup(queue: &JobQueue, job: &Job, config: &WorkerConfig) {
    if job.job_type != JOB_TYPE_MAILBOX_HISTORY_SYNC {
        return;
    }
    let (Some(organization_id), Some(mailbox_id)) =
        (job.organization_id.as_deref(), job.mailbox_id.as_deref())
    else {
        return;
    };

    let run_at = Utc::now()
        + chrono::Duration::milliseconds(config.history_poll_interval.as_millis() as i64);
    match enqueue_mailbox_history_sync(
        queue,
        organization_id,
        mailbox_id,
        "scheduled_poll",
        Some(run_at),
    )
    .await
    {
        Ok(Some(_)) => {
            info!(mailbox_id = %mailbox_id, "scheduled next history poll");
        }
        Ok(None) => {}
        Err(err) => {
            warn!(mailbox_id = %mailbox_id, error = %err, "failed to schedule history poll");
        }
    }
}
