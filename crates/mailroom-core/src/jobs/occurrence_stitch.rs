use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::ingest::fingerprint::extract_uuid_header;
use crate::jobs::{JOB_TYPE_TICKET_APPLY_ROUTING, JobDispatcher};
use crate::messages::{MessageRepository, StoredContent};
use crate::occurrences::{Occurrence, OccurrenceRepository, OccurrenceState, PipelineStage};
use crate::queue::{Job, JobQueue};
use crate::tickets::{NewTicket, TicketRepository};
use crate::worker::JobError;

const OSS_TICKET_ID_HEADER: &str = "X-OSS-Ticket-ID";

static REPLY_TO_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ticket\+([a-z0-9\-]+)@").expect("reply-to token regex"));

#[derive(Debug, Deserialize)]
struct StitchPayload {
    occurrence_id: String,
}

struct StitchTarget {
    ticket_id: String,
    reason: &'static str,
    confidence: &'static str,
}

/// Decide which ticket the canonical message belongs to. Precedence: the
/// self-addressed ticket header, then reply-to tokens, then RFC 2822
/// threading, then a fresh ticket. A message already linked somewhere keeps
/// that link, so replica occurrences never split into new tickets.
pub async fn handle_occurrence_stitch(
    dispatcher: &JobDispatcher,
    job: Job,
) -> Result<(), JobError> {
    let payload: StitchPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::Fatal(format!("invalid occurrence_stitch payload: {err}")))?;

    let occurrences = OccurrenceRepository::new(dispatcher.db.clone());
    let Some(occurrence) = occurrences
        .get(&payload.occurrence_id)
        .await
        .map_err(|err| JobError::Retryable(format!("load occurrence: {err}")))?
    else {
        debug!(occurrence_id = %payload.occurrence_id, "occurrence vanished; nothing to stitch");
        return Ok(());
    };

    if occurrence.ticket_id.is_some() && occurrence.state.reached(OccurrenceState::Stitched) {
        debug!(occurrence_id = %occurrence.id, "already stitched; skipping");
        return Ok(());
    }

    let Some(message_id) = occurrence.message_id.clone() else {
        occurrences
            .mark_failed(&occurrence.id, PipelineStage::Stitch, "missing message_id")
            .await
            .map_err(|err| JobError::Retryable(format!("mark failed: {err}")))?;
        return Ok(());
    };

    let tickets = TicketRepository::new(dispatcher.db.clone());

    // Re-stitching a duplicate never creates a second ticket.
    let existing = tickets
        .find_ticket_for_message(&occurrence.organization_id, &message_id)
        .await
        .map_err(|err| JobError::Retryable(format!("lookup message link: {err}")))?;
    if let Some(ticket_id) = existing {
        finish(dispatcher, &occurrences, &occurrence, &ticket_id).await?;
        return Ok(());
    }

    let messages = MessageRepository::new(dispatcher.db.clone());
    let Some(content) = messages
        .latest_content(&occurrence.organization_id, &message_id)
        .await
        .map_err(|err| JobError::Retryable(format!("load content: {err}")))?
    else {
        occurrences
            .mark_failed(&occurrence.id, PipelineStage::Stitch, "missing message content")
            .await
            .map_err(|err| JobError::Retryable(format!("mark failed: {err}")))?;
        return Ok(());
    };

    let target = choose_ticket(&tickets, &messages, &occurrence, &content).await?;

    tickets
        .link_message(
            &occurrence.organization_id,
            &target.ticket_id,
            &message_id,
            target.reason,
            target.confidence,
        )
        .await
        .map_err(|err| JobError::Retryable(format!("link message: {err}")))?;

    finish(dispatcher, &occurrences, &occurrence, &target.ticket_id).await?;
    Ok(())
}

async fn choose_ticket(
    tickets: &TicketRepository,
    messages: &MessageRepository,
    occurrence: &Occurrence,
    content: &StoredContent,
) -> Result<StitchTarget, JobError> {
    let organization_id = &occurrence.organization_id;

    // 1. Self-addressed ticket header always wins.
    if let Some(oss_ticket_id) = extract_uuid_header(&content.headers, OSS_TICKET_ID_HEADER) {
        let ticket_id = tickets
            .get_or_create_with_id(
                organization_id,
                &oss_ticket_id.to_string(),
                ticket_fields(content, "x_oss_ticket_id", "high"),
            )
            .await
            .map_err(|err| JobError::Retryable(format!("get-or-create ticket: {err}")))?;
        return Ok(StitchTarget {
            ticket_id,
            reason: "x_oss_ticket_id",
            confidence: "high",
        });
    }

    // 2. Reply-to token carrying the ticket code.
    for email in &content.reply_to_emails {
        let lowered = email.to_lowercase();
        let Some(captures) = REPLY_TO_TOKEN_RE.captures(&lowered) else {
            continue;
        };
        let code = captures.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
        if let Some(ticket_id) = tickets
            .find_by_code(organization_id, &code)
            .await
            .map_err(|err| JobError::Retryable(format!("lookup ticket code: {err}")))?
        {
            return Ok(StitchTarget {
                ticket_id,
                reason: "reply_to_token",
                confidence: "high",
            });
        }
    }

    // 3. In-Reply-To / References chains through known canonical messages.
    let message_id = occurrence.message_id.as_deref().unwrap_or_default();
    let refs = messages
        .thread_refs(organization_id, message_id)
        .await
        .map_err(|err| JobError::Retryable(format!("load thread refs: {err}")))?;
    for (_ref_type, ref_rfc_message_id) in &refs {
        let Some(referenced) = messages
            .lookup_by_rfc_id(organization_id, ref_rfc_message_id)
            .await
            .map_err(|err| JobError::Retryable(format!("lookup rfc id: {err}")))?
        else {
            continue;
        };
        if let Some(ticket_id) = tickets
            .find_ticket_for_message(organization_id, &referenced)
            .await
            .map_err(|err| JobError::Retryable(format!("lookup referenced ticket: {err}")))?
        {
            return Ok(StitchTarget {
                ticket_id,
                reason: "threading",
                confidence: "medium",
            });
        }
    }

    // 4. Nothing matched: open a fresh ticket.
    let ticket = tickets
        .create(organization_id, ticket_fields(content, "new_message", "low"))
        .await
        .map_err(|err| JobError::Retryable(format!("create ticket: {err}")))?;
    Ok(StitchTarget {
        ticket_id: ticket.id,
        reason: "new_ticket",
        confidence: "low",
    })
}

fn ticket_fields(content: &StoredContent, reason: &str, confidence: &str) -> NewTicket {
    NewTicket {
        subject: content.subject.clone(),
        subject_norm: content.subject_norm.clone(),
        requester_email: content.from_email.clone(),
        requester_name: content.from_name.clone(),
        first_message_at: content.date_header,
        stitch_reason: reason.to_string(),
        stitch_confidence: confidence.to_string(),
    }
}

async fn finish(
    dispatcher: &JobDispatcher,
    occurrences: &OccurrenceRepository,
    occurrence: &Occurrence,
    ticket_id: &str,
) -> Result<(), JobError> {
    occurrences
        .mark_stitched(&occurrence.id, ticket_id)
        .await
        .map_err(|err| JobError::Retryable(format!("mark stitched: {err}")))?;

    let queue = JobQueue::new(dispatcher.db.clone());
    queue
        .enqueue(
            JOB_TYPE_TICKET_APPLY_ROUTING,
            Some(&occurrence.organization_id),
            Some(&occurrence.mailbox_id),
            serde_json::json!({"occurrence_id": occurrence.id}),
            Some(format!("ticket_apply_routing:{}", occurrence.id)),
            None,
        )
        .await
        .map_err(|err| JobError::Retryable(format!("enqueue routing: {err}")))?;
    Ok(())
}
