use serde::Deserialize;
use tracing::{debug, warn};

use crate::blobs::{BlobKind, BlobRepository, attachment_key};
use crate::ingest::fingerprint::{
    compute_fingerprint_v1, compute_signature_v1, extract_uuid_header, sha256_bytes,
};
use crate::ingest::parser::parse_raw_email;
use crate::ingest::recipient::resolve_original_recipient;
use crate::jobs::{JOB_TYPE_OCCURRENCE_STITCH, JobDispatcher};
use crate::messages::{CanonicalIdentity, MessageDirection, MessageRepository};
use crate::occurrences::{OccurrenceRepository, OccurrenceState, PipelineStage};
use crate::queue::{Job, JobQueue};
use crate::worker::JobError;

const OSS_MESSAGE_ID_HEADER: &str = "X-OSS-Message-ID";

#[derive(Debug, Deserialize)]
struct ParsePayload {
    occurrence_id: String,
}

/// Parse the stored raw bytes, resolve the canonical message (deduplicating
/// provider replicas and outbound mirrors), store contents, attachments and
/// thread refs, and resolve the original recipient.
pub async fn handle_occurrence_parse(
    dispatcher: &JobDispatcher,
    job: Job,
) -> Result<(), JobError> {
    let payload: ParsePayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::Fatal(format!("invalid occurrence_parse payload: {err}")))?;

    let occurrences = OccurrenceRepository::new(dispatcher.db.clone());
    let Some(occurrence) = occurrences
        .get(&payload.occurrence_id)
        .await
        .map_err(|err| JobError::Retryable(format!("load occurrence: {err}")))?
    else {
        debug!(occurrence_id = %payload.occurrence_id, "occurrence vanished; nothing to parse");
        return Ok(());
    };

    if occurrence.message_id.is_some() && occurrence.state.reached(OccurrenceState::Parsed) {
        debug!(occurrence_id = %occurrence.id, "already parsed; skipping");
        return Ok(());
    }

    let Some(raw_blob_id) = occurrence.raw_blob_id.as_deref() else {
        occurrences
            .mark_failed(&occurrence.id, PipelineStage::Parse, "missing raw_blob_id")
            .await
            .map_err(|err| JobError::Retryable(format!("mark failed: {err}")))?;
        return Ok(());
    };

    let blobs = BlobRepository::new(dispatcher.db.clone());
    let raw_blob = match blobs.get(&occurrence.organization_id, raw_blob_id).await {
        Ok(raw_blob) => raw_blob,
        Err(crate::blobs::BlobError::NotFound(_)) => {
            occurrences
                .mark_failed(&occurrence.id, PipelineStage::Parse, "raw blob row missing")
                .await
                .map_err(|err| JobError::Retryable(format!("mark failed: {err}")))?;
            return Ok(());
        }
        Err(err) => {
            return Err(JobError::Retryable(format!("load raw blob row: {err}")));
        }
    };

    let raw_bytes = match dispatcher.blob_store.get(&raw_blob.storage_key).await {
        Ok(bytes) => bytes,
        Err(err) => {
            occurrences
                .mark_failed(
                    &occurrence.id,
                    PipelineStage::Parse,
                    &format!("blob read failed: {err}"),
                )
                .await
                .map_err(|err| JobError::Retryable(format!("mark failed: {err}")))?;
            return Ok(());
        }
    };

    let parsed = parse_raw_email(&raw_bytes);
    let attachment_sha: Vec<[u8; 32]> = parsed
        .attachments
        .iter()
        .map(|a| sha256_bytes(&a.payload))
        .collect();
    let fingerprint = compute_fingerprint_v1(&parsed, &attachment_sha);
    let signature = compute_signature_v1(&parsed, &attachment_sha);
    let oss_message_id = extract_uuid_header(&parsed.headers, OSS_MESSAGE_ID_HEADER);

    let messages = MessageRepository::new(dispatcher.db.clone());
    let message_id = messages
        .upsert_canonical(CanonicalIdentity {
            organization_id: &occurrence.organization_id,
            direction: MessageDirection::Inbound,
            oss_message_id,
            rfc_message_id: parsed.rfc_message_id.as_deref(),
            fingerprint_v1: &fingerprint,
            signature_v1: &signature,
        })
        .await
        .map_err(|err| JobError::Retryable(format!("upsert canonical message: {err}")))?;

    messages
        .insert_content(&occurrence.organization_id, &message_id, &parsed)
        .await
        .map_err(|err| JobError::Retryable(format!("insert content: {err}")))?;

    for (attachment, sha) in parsed.attachments.iter().zip(attachment_sha.iter()) {
        let storage_key = attachment_key(&occurrence.organization_id, sha);
        match dispatcher
            .blob_store
            .put(&storage_key, &attachment.payload, attachment.content_type.as_deref())
            .await
        {
            Ok(stored) => {
                let blob_id = blobs
                    .upsert(
                        &occurrence.organization_id,
                        BlobKind::Attachment,
                        sha,
                        stored.size_bytes,
                        &stored.storage_key,
                        attachment.content_type.as_deref(),
                    )
                    .await
                    .map_err(|err| {
                        JobError::Retryable(format!("register attachment blob: {err}"))
                    })?;
                messages
                    .insert_attachment(
                        &occurrence.organization_id,
                        &message_id,
                        &blob_id,
                        attachment,
                        sha,
                    )
                    .await
                    .map_err(|err| JobError::Retryable(format!("link attachment: {err}")))?;
            }
            Err(err) => {
                warn!(
                    occurrence_id = %occurrence.id,
                    filename = attachment.filename.as_deref().unwrap_or("<unnamed>"),
                    error = %err,
                    "attachment store failed; continuing without it"
                );
            }
        }
    }

    messages
        .insert_thread_refs(
            &occurrence.organization_id,
            &message_id,
            parsed.in_reply_to.as_deref(),
            &parsed.references,
        )
        .await
        .map_err(|err| JobError::Retryable(format!("insert thread refs: {err}")))?;

    let recipient =
        resolve_original_recipient(&parsed.headers, &parsed.to_emails, &parsed.cc_emails);
    occurrences
        .mark_parsed(&occurrence.id, &message_id, &recipient)
        .await
        .map_err(|err| JobError::Retryable(format!("mark parsed: {err}")))?;

    let queue = JobQueue::new(dispatcher.db.clone());
    queue
        .enqueue(
            JOB_TYPE_OCCURRENCE_STITCH,
            Some(&occurrence.organization_id),
            Some(&occurrence.mailbox_id),
            serde_json::json!({"occurrence_id": occurrence.id}),
            Some(format!("occurrence_stitch:{}", occurrence.id)),
            None,
        )
        .await
        .map_err(|err| JobError::Retryable(format!("enqueue stitch: {err}")))?;

    Ok(())
}
