use serde::Deserialize;

use crate::jobs::{JobDispatcher, map_sync_error};
use crate::queue::Job;
use crate::sync::sync_mailbox_history;
use crate::worker::JobError;

#[derive(Debug, Deserialize)]
struct HistorySyncPayload {
    organization_id: String,
    mailbox_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    reason: Option<String>,
}

pub async fn handle_mailbox_history_sync(
    dispatcher: &JobDispatcher,
    job: Job,
) -> Result<(), JobError> {
    let payload: HistorySyncPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::Fatal(format!("invalid mailbox_history_sync payload: {err}")))?;

    sync_mailbox_history(
        &dispatcher.sync_context(),
        &payload.organization_id,
        &payload.mailbox_id,
    )
    .await
    .map_err(|err| map_sync_error("mailbox history sync", err))
}
