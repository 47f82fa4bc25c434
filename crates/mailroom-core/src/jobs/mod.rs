use std::sync::Arc;

use async_trait::async_trait;

use crate::config::GoogleConfig;
use crate::crypto::TokenCipher;
use crate::db::Database;
use crate::queue::Job;
use crate::storage::BlobStore;
use crate::sync::{SyncContext, SyncError};
use crate::worker::{JobError, JobExecutor};

mod mailbox_backfill;
mod mailbox_history_sync;
mod occurrence_fetch_raw;
mod occurrence_parse;
mod occurrence_stitch;
mod outbound_send;
mod ticket_apply_routing;

use mailbox_backfill::handle_mailbox_backfill;
use mailbox_history_sync::handle_mailbox_history_sync;
use occurrence_fetch_raw::handle_occurrence_fetch_raw;
use occurrence_parse::handle_occurrence_parse;
use occurrence_stitch::handle_occurrence_stitch;
use outbound_send::handle_outbound_send;
use ticket_apply_routing::handle_ticket_apply_routing;

pub const JOB_TYPE_MAILBOX_BACKFILL: &str = "mailbox_backfill";
pub const JOB_TYPE_MAILBOX_HISTORY_SYNC: &str = "mailbox_history_sync";
pub const JOB_TYPE_OCCURRENCE_FETCH_RAW: &str = "occurrence_fetch_raw";
pub const JOB_TYPE_OCCURRENCE_PARSE: &str = "occurrence_parse";
pub const JOB_TYPE_OCCURRENCE_STITCH: &str = "occurrence_stitch";
pub const JOB_TYPE_TICKET_APPLY_ROUTING: &str = "ticket_apply_routing";
pub const JOB_TYPE_OUTBOUND_SEND: &str = "outbound_send";

/// Closed set of job handlers, dispatched by job type string. Every handler
/// is idempotent at its state gate, so at-least-once delivery is safe.
#[derive(Clone)]
pub struct JobDispatcher {
    pub db: Database,
    pub http: reqwest::Client,
    pub cipher: Arc<TokenCipher>,
    pub blob_store: Arc<dyn BlobStore>,
    pub google: GoogleConfig,
    pub gmail_api_base: Option<String>,
    pub token_endpoint: Option<String>,
}

impl JobDispatcher {
    pub fn new(
        db: Database,
        http: reqwest::Client,
        cipher: Arc<TokenCipher>,
        blob_store: Arc<dyn BlobStore>,
        google: GoogleConfig,
    ) -> Self {
        Self {
            db,
            http,
            cipher,
            blob_store,
            google,
            gmail_api_base: None,
            token_endpoint: None,
        }
    }

    pub fn with_gmail_api_base(mut self, base: impl Into<String>) -> Self {
        self.gmail_api_base = Some(base.into());
        self
    }

    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = Some(endpoint.into());
        self
    }

    pub(crate) fn sync_context(&self) -> SyncContext<'_> {
        SyncContext {
            db: &self.db,
            http: &self.http,
            cipher: &self.cipher,
            google: &self.google,
            gmail_api_base: self.gmail_api_base.as_deref(),
            token_endpoint: self.token_endpoint.as_deref(),
        }
    }
}

#[async_trait]
impl JobExecutor for JobDispatcher {
    async fn execute(&self, job: Job) -> Result<(), JobError> {
        match job.job_type.as_str() {
            JOB_TYPE_MAILBOX_BACKFILL => handle_mailbox_backfill(self, job).await,
            JOB_TYPE_MAILBOX_HISTORY_SYNC => handle_mailbox_history_sync(self, job).await,
            JOB_TYPE_OCCURRENCE_FETCH_RAW => handle_occurrence_fetch_raw(self, job).await,
            JOB_TYPE_OCCURRENCE_PARSE => handle_occurrence_parse(self, job).await,
            JOB_TYPE_OCCURRENCE_STITCH => handle_occurrence_stitch(self, job).await,
            JOB_TYPE_TICKET_APPLY_ROUTING => handle_ticket_apply_routing(self, job).await,
            JOB_TYPE_OUTBOUND_SEND => handle_outbound_send(self, job).await,
            other => Err(JobError::Fatal(format!("unknown job type: {other}"))),
        }
    }
}

/// Provider, credential, and storage hiccups during sync retry with backoff;
/// persistent ones eventually trip the mailbox circuit breaker.
pub(crate) fn map_sync_error(context: &str, err: SyncError) -> JobError {
    JobError::Retryable(format!("{context}: {err}"))
}
