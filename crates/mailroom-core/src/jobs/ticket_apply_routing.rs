use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::jobs::JobDispatcher;
use crate::occurrences::{OccurrenceRepository, OccurrenceState, PipelineStage};
use crate::queue::Job;
use crate::routing::{RoutingRepository, rule_matches};
use crate::tickets::TicketRepository;
use crate::worker::JobError;

#[derive(Debug, Deserialize)]
struct ApplyRoutingPayload {
    occurrence_id: String,
}

/// Post-stitch routing: a recipient outside the allowlist classifies the
/// ticket as spam; otherwise the first matching enabled rule (priority
/// order) is applied and recorded.
pub async fn handle_ticket_apply_routing(
    dispatcher: &JobDispatcher,
    job: Job,
) -> Result<(), JobError> {
    let payload: ApplyRoutingPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::Fatal(format!("invalid ticket_apply_routing payload: {err}")))?;

    let occurrences = OccurrenceRepository::new(dispatcher.db.clone());
    let Some(occurrence) = occurrences
        .get(&payload.occurrence_id)
        .await
        .map_err(|err| JobError::Retryable(format!("load occurrence: {err}")))?
    else {
        debug!(occurrence_id = %payload.occurrence_id, "occurrence vanished; nothing to route");
        return Ok(());
    };

    if occurrence.state == OccurrenceState::Routed {
        debug!(occurrence_id = %occurrence.id, "already routed; skipping");
        return Ok(());
    }

    let Some(ticket_id) = occurrence.ticket_id.clone() else {
        occurrences
            .mark_failed(&occurrence.id, PipelineStage::Route, "missing ticket_id")
            .await
            .map_err(|err| JobError::Retryable(format!("mark failed: {err}")))?;
        return Ok(());
    };

    let organization_id = occurrence.organization_id.clone();
    let recipient = occurrence
        .original_recipient
        .as_deref()
        .unwrap_or("")
        .to_lowercase();

    let routing = RoutingRepository::new(dispatcher.db.clone());
    let tickets = TicketRepository::new(dispatcher.db.clone());

    let allowlisted = routing
        .is_allowlisted(&organization_id, &recipient)
        .await
        .map_err(|err| JobError::Retryable(format!("allowlist check: {err}")))?;

    if !allowlisted {
        tickets
            .mark_spam(&organization_id, &ticket_id)
            .await
            .map_err(|err| JobError::Retryable(format!("mark spam: {err}")))?;
        tickets
            .insert_event(
                &organization_id,
                &ticket_id,
                "auto_spam",
                &json!({"occurrence_id": occurrence.id, "recipient": recipient}),
            )
            .await
            .map_err(|err| JobError::Retryable(format!("record auto_spam: {err}")))?;
        occurrences
            .mark_routed(&occurrence.id)
            .await
            .map_err(|err| JobError::Retryable(format!("mark routed: {err}")))?;
        info!(occurrence_id = %occurrence.id, "recipient not allowlisted; ticket marked spam");
        return Ok(());
    }

    let sender = tickets
        .latest_sender(&organization_id, &ticket_id)
        .await
        .map_err(|err| JobError::Retryable(format!("load sender: {err}")))?;
    let (from_email, direction) = match sender {
        Some((from_email, direction)) => {
            (from_email.unwrap_or_default().to_lowercase(), Some(direction))
        }
        None => (String::new(), None),
    };
    let sender_domain = from_email
        .split_once('@')
        .map(|(_, domain)| domain.to_string())
        .unwrap_or_default();

    let rules = routing
        .list_enabled_rules(&organization_id)
        .await
        .map_err(|err| JobError::Retryable(format!("load rules: {err}")))?;

    for rule in &rules {
        if !rule_matches(rule, &recipient, &sender_domain, &from_email, direction.as_deref()) {
            continue;
        }

        let (before, after) = routing
            .apply_rule_to_ticket(&organization_id, &ticket_id, rule)
            .await
            .map_err(|err| JobError::Retryable(format!("apply rule: {err}")))?;
        tickets
            .insert_event(
                &organization_id,
                &ticket_id,
                "routing_applied",
                &json!({
                    "occurrence_id": occurrence.id,
                    "rule_id": rule.id,
                    "before": before.to_json(),
                    "after": after.to_json(),
                }),
            )
            .await
            .map_err(|err| JobError::Retryable(format!("record routing event: {err}")))?;
        info!(occurrence_id = %occurrence.id, rule_id = %rule.id, "routing rule applied");
        break;
    }

    occurrences
        .mark_routed(&occurrence.id)
        .await
        .map_err(|err| JobError::Retryable(format!("mark routed: {err}")))?;
    Ok(())
}
