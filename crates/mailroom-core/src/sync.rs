use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::GoogleConfig;
use crate::credentials::{CredentialError, CredentialRepository};
use crate::crypto::TokenCipher;
use crate::db::Database;
use crate::gmail::client::{GmailClient, GmailError};
use crate::gmail::oauth::TOKEN_ENDPOINT;
use crate::gmail::types::{RawMessage, parse_history_id};
use crate::jobs::{
    JOB_TYPE_MAILBOX_BACKFILL, JOB_TYPE_MAILBOX_HISTORY_SYNC, JOB_TYPE_OCCURRENCE_FETCH_RAW,
};
use crate::mailboxes::{Mailbox, MailboxError, MailboxRepository};
use crate::occurrences::{DiscoveredOccurrence, OccurrenceError, OccurrenceRepository};
use crate::queue::{JobQueue, QueueError};

/// Everything a sync pass needs besides the ids in the job payload.
pub struct SyncContext<'a> {
    pub db: &'a Database,
    pub http: &'a reqwest::Client,
    pub cipher: &'a TokenCipher,
    pub google: &'a GoogleConfig,
    /// Test override for the Gmail API base URL.
    pub gmail_api_base: Option<&'a str>,
    /// Test override for the OAuth token endpoint.
    pub token_endpoint: Option<&'a str>,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("mailbox error: {0}")]
    Mailbox(#[from] MailboxError),
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),
    #[error("gmail error: {0}")]
    Gmail(#[from] GmailError),
    #[error("occurrence error: {0}")]
    Occurrence(#[from] OccurrenceError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("invalid raw payload: {0}")]
    InvalidRaw(String),
}

pub async fn enqueue_mailbox_backfill(
    queue: &JobQueue,
    organization_id: &str,
    mailbox_id: &str,
    reason: &str,
) -> Result<Option<String>, QueueError> {
    queue
        .enqueue(
            JOB_TYPE_MAILBOX_BACKFILL,
            Some(organization_id),
            Some(mailbox_id),
            json!({
                "organization_id": organization_id,
                "mailbox_id": mailbox_id,
                "reason": reason,
            }),
            Some(format!("mailbox_backfill:{mailbox_id}")),
            None,
        )
        .await
}

pub async fn enqueue_mailbox_history_sync(
    queue: &JobQueue,
    organization_id: &str,
    mailbox_id: &str,
    reason: &str,
    run_at: Option<DateTime<Utc>>,
) -> Result<Option<String>, QueueError> {
    queue
        .enqueue(
            JOB_TYPE_MAILBOX_HISTORY_SYNC,
            Some(organization_id),
            Some(mailbox_id),
            json!({
                "organization_id": organization_id,
                "mailbox_id": mailbox_id,
                "reason": reason,
            }),
            Some(format!("mailbox_history_sync:{mailbox_id}")),
            run_at,
        )
        .await
}

/// Walk every message in the mailbox, upsert occurrences, and queue raw
/// fetches. Disabled or paused mailboxes are a silent no-op. Finishing
/// advances the watermarks and queues the first incremental poll.
pub async fn sync_mailbox_backfill(
    ctx: &SyncContext<'_>,
    organization_id: &str,
    mailbox_id: &str,
) -> Result<(), SyncError> {
    let mailboxes = MailboxRepository::new(ctx.db.clone());
    let Some(mailbox) = mailboxes.load_for_sync(organization_id, mailbox_id).await? else {
        debug!(mailbox_id, "mailbox not eligible for sync; skipping backfill");
        return Ok(());
    };

    let client = gmail_client(ctx, organization_id, &mailbox).await?;
    let queue = JobQueue::new(ctx.db.clone());
    let occurrences = OccurrenceRepository::new(ctx.db.clone());

    let mut highest_history_id = mailbox.gmail_history_id;
    let mut page_token: Option<String> = None;
    let mut discovered = 0usize;

    loop {
        let page = match client.list_messages(page_token.as_deref(), None).await {
            Ok(page) => page,
            Err(err) => {
                let code = err.status().unwrap_or(0);
                mailboxes
                    .record_sync_error(
                        organization_id,
                        mailbox_id,
                        &format!("Gmail backfill failed ({code})"),
                    )
                    .await?;
                return Err(err.into());
            }
        };

        for listed in &page.messages {
            let raw_msg = match client.get_message_raw(&listed.id).await {
                Ok(raw_msg) => raw_msg,
                Err(err) => {
                    let code = err.status().unwrap_or(0);
                    mailboxes
                        .record_sync_error(
                            organization_id,
                            mailbox_id,
                            &format!("Gmail backfill failed ({code})"),
                        )
                        .await?;
                    return Err(err.into());
                }
            };

            ingest_raw_message(
                &occurrences,
                &queue,
                organization_id,
                mailbox_id,
                &raw_msg,
                &mut highest_history_id,
            )
            .await?;
            discovered += 1;
        }

        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    mailboxes
        .record_backfill_complete(organization_id, mailbox_id, highest_history_id)
        .await?;

    enqueue_mailbox_history_sync(&queue, organization_id, mailbox_id, "post_backfill", None)
        .await?;

    info!(mailbox_id, discovered, "mailbox backfill complete");
    Ok(())
}

/// Incremental pass from the stored history watermark. An expired watermark
/// recovers by queueing a full backfill and reporting success.
pub async fn sync_mailbox_history(
    ctx: &SyncContext<'_>,
    organization_id: &str,
    mailbox_id: &str,
) -> Result<(), SyncError> {
    let mailboxes = MailboxRepository::new(ctx.db.clone());
    let Some(mailbox) = mailboxes.load_for_sync(organization_id, mailbox_id).await? else {
        debug!(mailbox_id, "mailbox not eligible for sync; skipping history");
        return Ok(());
    };

    let queue = JobQueue::new(ctx.db.clone());
    let Some(start_history_id) = mailbox.gmail_history_id else {
        mailboxes
            .record_sync_error(
                organization_id,
                mailbox_id,
                "No gmail_history_id; queued full backfill",
            )
            .await?;
        enqueue_mailbox_backfill(&queue, organization_id, mailbox_id, "missing_history_id")
            .await?;
        return Ok(());
    };

    let client = gmail_client(ctx, organization_id, &mailbox).await?;
    let occurrences = OccurrenceRepository::new(ctx.db.clone());

    let mut highest_history_id = Some(start_history_id);
    let mut page_token: Option<String> = None;
    let mut ordered_message_ids: Vec<String> = Vec::new();

    loop {
        let page = match client
            .list_history(start_history_id, page_token.as_deref(), None)
            .await
        {
            Ok(page) => page,
            Err(GmailError::HistoryExpired) => {
                mailboxes
                    .record_sync_error(
                        organization_id,
                        mailbox_id,
                        "Gmail history is invalid/expired; queued full backfill",
                    )
                    .await?;
                enqueue_mailbox_backfill(&queue, organization_id, mailbox_id, "history_invalid")
                    .await?;
                info!(mailbox_id, "history watermark expired; backfill queued");
                return Ok(());
            }
            Err(err) => {
                let code = err.status().unwrap_or(0);
                mailboxes
                    .record_sync_error(
                        organization_id,
                        mailbox_id,
                        &format!("Gmail incremental sync failed ({code})"),
                    )
                    .await?;
                return Err(err.into());
            }
        };

        track_highest(&mut highest_history_id, parse_history_id(page.history_id.as_deref()));

        for record in &page.history {
            track_highest(&mut highest_history_id, parse_history_id(record.id.as_deref()));
            for added in record.messages_added.iter().flatten() {
                if !ordered_message_ids.contains(&added.message.id) {
                    ordered_message_ids.push(added.message.id.clone());
                }
            }
        }

        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    for message_id in &ordered_message_ids {
        let raw_msg = match client.get_message_raw(message_id).await {
            Ok(raw_msg) => raw_msg,
            Err(err) => {
                let code = err.status().unwrap_or(0);
                mailboxes
                    .record_sync_error(
                        organization_id,
                        mailbox_id,
                        &format!("Gmail incremental sync failed ({code})"),
                    )
                    .await?;
                return Err(err.into());
            }
        };

        ingest_raw_message(
            &occurrences,
            &queue,
            organization_id,
            mailbox_id,
            &raw_msg,
            &mut highest_history_id,
        )
        .await?;
    }

    mailboxes
        .record_incremental_complete(organization_id, mailbox_id, highest_history_id)
        .await?;

    info!(
        mailbox_id,
        discovered = ordered_message_ids.len(),
        "mailbox history sync complete"
    );
    Ok(())
}

async fn gmail_client(
    ctx: &SyncContext<'_>,
    organization_id: &str,
    mailbox: &Mailbox,
) -> Result<GmailClient, SyncError> {
    let credentials = CredentialRepository::new(ctx.db.clone());
    let access_token = credentials
        .access_token(
            organization_id,
            &mailbox.oauth_credential_id,
            ctx.cipher,
            ctx.http,
            ctx.token_endpoint.unwrap_or(TOKEN_ENDPOINT),
            &ctx.google.client_id,
            &ctx.google.client_secret,
        )
        .await?;

    let mut client = GmailClient::new(ctx.http.clone(), access_token);
    if let Some(api_base) = ctx.gmail_api_base {
        client = client.with_api_base(api_base);
    }
    Ok(client)
}

/// Upsert the occurrence for one provider message and queue its raw fetch.
/// The raw payload rides along in the job, converted to standard base64.
async fn ingest_raw_message(
    occurrences: &OccurrenceRepository,
    queue: &JobQueue,
    organization_id: &str,
    mailbox_id: &str,
    raw_msg: &RawMessage,
    highest_history_id: &mut Option<i64>,
) -> Result<(), SyncError> {
    let internal_date = raw_msg
        .internal_date
        .as_deref()
        .and_then(|raw| raw.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

    let occurrence_id = occurrences
        .upsert_discovered(DiscoveredOccurrence {
            organization_id,
            mailbox_id,
            provider_message_id: &raw_msg.id,
            provider_thread_id: raw_msg.thread_id.as_deref(),
            provider_history_id: parse_history_id(raw_msg.history_id.as_deref()),
            internal_date,
            label_ids: &raw_msg.label_ids,
        })
        .await?;

    let raw_base64 = base64url_to_base64(raw_msg.raw.as_deref().unwrap_or(""))?;
    queue
        .enqueue(
            JOB_TYPE_OCCURRENCE_FETCH_RAW,
            Some(organization_id),
            Some(mailbox_id),
            json!({
                "occurrence_id": occurrence_id,
                "raw_eml_base64": raw_base64,
            }),
            Some(format!("occurrence_fetch_raw:{occurrence_id}")),
            None,
        )
        .await?;

    track_highest(
        highest_history_id,
        parse_history_id(raw_msg.history_id.as_deref()),
    );
    Ok(())
}

fn track_highest(current: &mut Option<i64>, candidate: Option<i64>) {
    if let Some(candidate) = candidate {
        if current.map_or(true, |existing| candidate > existing) {
            *current = Some(candidate);
        }
    }
}

/// Gmail hands out url-safe base64; job payloads carry standard base64.
fn base64url_to_base64(value: &str) -> Result<String, SyncError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|err| SyncError::InvalidRaw(err.to_string()))?;
    Ok(BASE64_STANDARD.encode(bytes))
}
