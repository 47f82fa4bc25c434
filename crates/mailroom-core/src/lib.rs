pub mod blobs;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod db;
pub mod gmail;
pub mod ingest;
pub mod jobs;
pub mod mailboxes;
pub mod messages;
pub mod migrations;
pub mod occurrences;
pub mod queue;
pub mod routing;
pub mod storage;
pub mod sync;
pub mod telemetry;
pub mod tickets;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use blobs::{BlobError, BlobKind, BlobRecord, BlobRepository, attachment_key, raw_eml_key};
pub use config::{AppConfig, Config, ConfigError, CryptoConfig, GoogleConfig, WorkerSettings};
pub use credentials::{CredentialError, CredentialRepository, OAuthCredential, credential_aad};
pub use crypto::{CryptoError, TokenCipher};
pub use db::{Database, DbError};
pub use gmail::{GmailClient, GmailError, GoogleTokenResponse, OAuthError};
pub use ingest::{
    ParsedAttachment, ParsedEmail, RecipientResolution, compute_fingerprint_v1,
    compute_signature_v1, extract_uuid_header, parse_raw_email, resolve_original_recipient,
    sanitize_html,
};
pub use jobs::{
    JOB_TYPE_MAILBOX_BACKFILL, JOB_TYPE_MAILBOX_HISTORY_SYNC, JOB_TYPE_OCCURRENCE_FETCH_RAW,
    JOB_TYPE_OCCURRENCE_PARSE, JOB_TYPE_OCCURRENCE_STITCH, JOB_TYPE_OUTBOUND_SEND,
    JOB_TYPE_TICKET_APPLY_ROUTING, JobDispatcher,
};
pub use mailboxes::{Mailbox, MailboxError, MailboxPurpose, MailboxRepository, NewMailbox};
pub use messages::{
    CanonicalIdentity, CanonicalMessage, MessageDirection, MessageError, MessageRepository,
    StoredContent,
};
pub use migrations::{MigrationError, run_migrations};
pub use occurrences::{
    DiscoveredOccurrence, Occurrence, OccurrenceError, OccurrenceRepository, OccurrenceState,
    PipelineStage,
};
pub use queue::{Job, JobQueue, JobStatus, QueueError};
pub use routing::{NewRoutingRule, RoutingError, RoutingRepository, RoutingRule, rule_matches};
pub use storage::{BlobStore, BlobStoreError, FsBlobStore, StoredBlob, attachment_disposition};
pub use sync::{
    SyncContext, SyncError, enqueue_mailbox_backfill, enqueue_mailbox_history_sync,
    sync_mailbox_backfill, sync_mailbox_history,
};
pub use telemetry::{TelemetryError, init_logging, init_telemetry};
pub use tickets::{
    NewTicket, OutboundMessage, OutboundReply, Ticket, TicketError, TicketRepository,
    new_ticket_code,
};
pub use worker::{JobError, JobExecutor, WorkerConfig, WorkerError, run_one_job, run_worker};
