use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use tracing::debug;

use crate::blobs::{BlobKind, BlobRepository, raw_eml_key};
use crate::ingest::fingerprint::sha256_bytes;
use crate::jobs::{JOB_TYPE_OCCURRENCE_PARSE, JobDispatcher};
use crate::occurrences::{OccurrenceRepository, OccurrenceState, PipelineStage};
use crate::queue::{Job, JobQueue};
use crate::worker::JobError;

#[derive(Debug, Deserialize)]
struct FetchRawPayload {
    occurrence_id: String,
    #[serde(default)]
    raw_eml_base64: Option<String>,
}

/// Persist the raw RFC 822 bytes for an occurrence as a content-addressed
/// blob and hand off to parsing. Gate: already fetched means no-op.
pub async fn handle_occurrence_fetch_raw(
    dispatcher: &JobDispatcher,
    job: Job,
) -> Result<(), JobError> {
    let payload: FetchRawPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::Fatal(format!("invalid occurrence_fetch_raw payload: {err}")))?;

    let occurrences = OccurrenceRepository::new(dispatcher.db.clone());
    let Some(occurrence) = occurrences
        .get(&payload.occurrence_id)
        .await
        .map_err(|err| JobError::Retryable(format!("load occurrence: {err}")))?
    else {
        debug!(occurrence_id = %payload.occurrence_id, "occurrence vanished; nothing to fetch");
        return Ok(());
    };

    if occurrence.raw_blob_id.is_some() && occurrence.state.reached(OccurrenceState::RawFetched) {
        debug!(occurrence_id = %occurrence.id, "raw already fetched; skipping");
        return Ok(());
    }

    let raw_base64 = payload.raw_eml_base64.as_deref().unwrap_or("");
    if raw_base64.is_empty() {
        occurrences
            .mark_failed(
                &occurrence.id,
                PipelineStage::RawFetch,
                "raw_eml_base64 missing from payload",
            )
            .await
            .map_err(|err| JobError::Retryable(format!("mark failed: {err}")))?;
        return Ok(());
    }

    let raw_bytes = match BASE64.decode(raw_base64) {
        Ok(bytes) => bytes,
        Err(err) => {
            let message = format!("raw_eml_base64 is not valid base64: {err}");
            occurrences
                .mark_failed(&occurrence.id, PipelineStage::RawFetch, &message)
                .await
                .map_err(|err| JobError::Retryable(format!("mark failed: {err}")))?;
            return Err(JobError::Fatal(message));
        }
    };

    let sha = sha256_bytes(&raw_bytes);
    let storage_key = raw_eml_key(&occurrence.organization_id, &sha);
    dispatcher
        .blob_store
        .put(&storage_key, &raw_bytes, Some("message/rfc822"))
        .await
        .map_err(|err| JobError::Retryable(format!("store raw blob: {err}")))?;

    let blobs = BlobRepository::new(dispatcher.db.clone());
    let raw_blob_id = blobs
        .upsert(
            &occurrence.organization_id,
            BlobKind::RawEml,
            &sha,
            raw_bytes.len() as u64,
            &storage_key,
            Some("message/rfc822"),
        )
        .await
        .map_err(|err| JobError::Retryable(format!("register raw blob: {err}")))?;

    occurrences
        .mark_raw_fetched(&occurrence.id, &raw_blob_id)
        .await
        .map_err(|err| JobError::Retryable(format!("mark raw_fetched: {err}")))?;

    let queue = JobQueue::new(dispatcher.db.clone());
    queue
        .enqueue(
            JOB_TYPE_OCCURRENCE_PARSE,
            Some(&occurrence.organization_id),
            Some(&occurrence.mailbox_id),
            serde_json::json!({"occurrence_id": occurrence.id}),
            Some(format!("occurrence_parse:{}", occurrence.id)),
            None,
        )
        .await
        .map_err(|err| JobError::Retryable(format!("enqueue parse: {err}")))?;

    Ok(())
}
