use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::jobs::JobDispatcher;
use crate::messages::{MessageError, MessageRepository};
use crate::queue::Job;
use crate::tickets::TicketRepository;
use crate::worker::JobError;

#[derive(Debug, Deserialize)]
struct OutboundSendPayload {
    organization_id: String,
    ticket_id: String,
    message_id: String,
    #[serde(default)]
    send_identity_id: Option<String>,
    #[serde(default)]
    to_emails: Vec<String>,
    #[serde(default)]
    cc_emails: Vec<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    body_text: Option<String>,
}

/// Exactly-once application of the outbound-sent state transition: replays
/// keyed by `event_data.message_id` are no-ops. Actual provider dispatch is
/// composed in front of this transition, not here.
pub async fn handle_outbound_send(dispatcher: &JobDispatcher, job: Job) -> Result<(), JobError> {
    let payload: OutboundSendPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::Fatal(format!("invalid outbound_send payload: {err}")))?;

    let messages = MessageRepository::new(dispatcher.db.clone());
    let message = match messages
        .get(&payload.organization_id, &payload.message_id)
        .await
    {
        Ok(message) => message,
        Err(MessageError::NotFound(_)) => {
            return Err(JobError::Fatal("outbound message is missing".into()));
        }
        Err(err) => return Err(JobError::Retryable(format!("load message: {err}"))),
    };
    if message.direction != "outbound" {
        return Err(JobError::Fatal("message direction must be outbound".into()));
    }

    let tickets = TicketRepository::new(dispatcher.db.clone());
    let already_sent = tickets
        .has_outbound_sent_event(
            &payload.organization_id,
            &payload.ticket_id,
            &payload.message_id,
        )
        .await
        .map_err(|err| JobError::Retryable(format!("replay check: {err}")))?;
    if already_sent {
        info!(message_id = %payload.message_id, "outbound send already recorded; skipping");
        return Ok(());
    }

    tickets
        .insert_event(
            &payload.organization_id,
            &payload.ticket_id,
            "outbound_sent",
            &json!({
                "message_id": payload.message_id,
                "send_identity_id": payload.send_identity_id,
                "to_emails": payload.to_emails,
                "cc_emails": payload.cc_emails,
                "subject": payload.subject,
                "body_text": payload.body_text,
            }),
        )
        .await
        .map_err(|err| JobError::Retryable(format!("record outbound_sent: {err}")))?;

    info!(message_id = %payload.message_id, ticket_id = %payload.ticket_id, "outbound send recorded");
    Ok(())
}
