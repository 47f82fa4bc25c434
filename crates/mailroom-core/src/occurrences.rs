use chrono::{DateTime, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_timestamp, to_rfc3339};
use crate::ingest::recipient::RecipientResolution;

const OCCURRENCE_COLUMNS: &str = "id, organization_id, mailbox_id, provider_message_id, provider_thread_id, provider_history_id, internal_date, label_ids, state, raw_blob_id, raw_fetch_error, message_id, parse_error, ticket_id, stitch_error, routed_at, route_error, original_recipient, original_recipient_source, original_recipient_confidence, original_recipient_evidence";

/// Pipeline position of one mailbox observation. Transitions only move
/// forward; `failed` is terminal for the stage that set it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccurrenceState {
    Discovered,
    RawFetched,
    Parsed,
    Stitched,
    Routed,
    Failed,
}

impl OccurrenceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OccurrenceState::Discovered => "discovered",
            OccurrenceState::RawFetched => "raw_fetched",
            OccurrenceState::Parsed => "parsed",
            OccurrenceState::Stitched => "stitched",
            OccurrenceState::Routed => "routed",
            OccurrenceState::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "discovered" => Some(OccurrenceState::Discovered),
            "raw_fetched" => Some(OccurrenceState::RawFetched),
            "parsed" => Some(OccurrenceState::Parsed),
            "stitched" => Some(OccurrenceState::Stitched),
            "routed" => Some(OccurrenceState::Routed),
            "failed" => Some(OccurrenceState::Failed),
            _ => None,
        }
    }

    /// Position on the forward path; `failed` ranks below everything so a
    /// failed occurrence re-enters at whatever stage is retried.
    fn rank(&self) -> u8 {
        match self {
            OccurrenceState::Failed => 0,
            OccurrenceState::Discovered => 1,
            OccurrenceState::RawFetched => 2,
            OccurrenceState::Parsed => 3,
            OccurrenceState::Stitched => 4,
            OccurrenceState::Routed => 5,
        }
    }

    pub fn reached(&self, target: OccurrenceState) -> bool {
        self.rank() >= target.rank()
    }
}

/// Which pipeline stage an error belongs to; selects the `*_error` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    RawFetch,
    Parse,
    Stitch,
    Route,
}

impl PipelineStage {
    fn error_column(&self) -> &'static str {
        match self {
            PipelineStage::RawFetch => "raw_fetch_error",
            PipelineStage::Parse => "parse_error",
            PipelineStage::Stitch => "stitch_error",
            PipelineStage::Route => "route_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Occurrence {
    pub id: String,
    pub organization_id: String,
    pub mailbox_id: String,
    pub provider_message_id: String,
    pub provider_thread_id: Option<String>,
    pub provider_history_id: Option<i64>,
    pub internal_date: Option<DateTime<Utc>>,
    pub label_ids: Vec<String>,
    pub state: OccurrenceState,
    pub raw_blob_id: Option<String>,
    pub raw_fetch_error: Option<String>,
    pub message_id: Option<String>,
    pub parse_error: Option<String>,
    pub ticket_id: Option<String>,
    pub stitch_error: Option<String>,
    pub routed_at: Option<DateTime<Utc>>,
    pub route_error: Option<String>,
    pub original_recipient: Option<String>,
    pub original_recipient_source: String,
    pub original_recipient_confidence: String,
    pub original_recipient_evidence: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct DiscoveredOccurrence<'a> {
    pub organization_id: &'a str,
    pub mailbox_id: &'a str,
    pub provider_message_id: &'a str,
    pub provider_thread_id: Option<&'a str>,
    pub provider_history_id: Option<i64>,
    pub internal_date: Option<DateTime<Utc>>,
    pub label_ids: &'a [String],
}

#[derive(Debug, Error)]
pub enum OccurrenceError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid occurrence row: {0}")]
    InvalidRow(String),
}

#[derive(Clone)]
pub struct OccurrenceRepository {
    db: Database,
}

impl OccurrenceRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record that a mailbox observed a provider message. Re-observation
    /// refreshes the provider mirror fields but never touches pipeline
    /// state or stage outputs.
    pub async fn upsert_discovered(
        &self,
        discovered: DiscoveredOccurrence<'_>,
    ) -> Result<String, OccurrenceError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "INSERT INTO message_occurrences (
                    id, organization_id, mailbox_id, provider_message_id, provider_thread_id,
                    provider_history_id, internal_date, label_ids, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'discovered', ?9, ?9)
                 ON CONFLICT (organization_id, mailbox_id, provider_message_id) DO UPDATE SET
                    provider_thread_id = excluded.provider_thread_id,
                    provider_history_id = excluded.provider_history_id,
                    internal_date = excluded.internal_date,
                    label_ids = excluded.label_ids,
                    updated_at = excluded.updated_at
                 RETURNING id",
                params![
                    Uuid::new_v4().to_string(),
                    discovered.organization_id,
                    discovered.mailbox_id,
                    discovered.provider_message_id,
                    discovered.provider_thread_id.map(|s| s.to_string()),
                    discovered.provider_history_id,
                    discovered.internal_date.map(to_rfc3339),
                    serde_json::to_string(discovered.label_ids)?,
                    now_rfc3339()
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Err(OccurrenceError::InvalidRow("upsert returned no row".into())),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Occurrence>, OccurrenceError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {OCCURRENCE_COLUMNS} FROM message_occurrences WHERE id = ?1"),
                params![id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_occurrence(row)?)),
            None => Ok(None),
        }
    }

    pub async fn mark_raw_fetched(
        &self,
        id: &str,
        raw_blob_id: &str,
    ) -> Result<(), OccurrenceError> {
        let conn = self.db.connection().await?;
        let now = now_rfc3339();
        conn.execute(
            "UPDATE message_occurrences
             SET raw_blob_id = ?2, raw_fetched_at = ?3, raw_fetch_error = NULL,
                 state = 'raw_fetched', updated_at = ?3
             WHERE id = ?1",
            params![id, raw_blob_id, now],
        )
        .await?;
        Ok(())
    }

    pub async fn mark_parsed(
        &self,
        id: &str,
        message_id: &str,
        recipient: &RecipientResolution,
    ) -> Result<(), OccurrenceError> {
        let conn = self.db.connection().await?;
        let now = now_rfc3339();
        conn.execute(
            "UPDATE message_occurrences
             SET message_id = ?2, parsed_at = ?3, parse_error = NULL,
                 original_recipient = ?4,
                 original_recipient_source = ?5,
                 original_recipient_confidence = ?6,
                 original_recipient_evidence = ?7,
                 state = 'parsed', updated_at = ?3
             WHERE id = ?1",
            params![
                id,
                message_id,
                now,
                recipient.recipient.clone(),
                recipient.source.as_str(),
                recipient.confidence.as_str(),
                serde_json::to_string(&recipient.evidence)?
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn mark_stitched(&self, id: &str, ticket_id: &str) -> Result<(), OccurrenceError> {
        let conn = self.db.connection().await?;
        let now = now_rfc3339();
        conn.execute(
            "UPDATE message_occurrences
             SET ticket_id = ?2, stitched_at = ?3, stitch_error = NULL,
                 state = 'stitched', updated_at = ?3
             WHERE id = ?1",
            params![id, ticket_id, now],
        )
        .await?;
        Ok(())
    }

    pub async fn mark_routed(&self, id: &str) -> Result<(), OccurrenceError> {
        let conn = self.db.connection().await?;
        let now = now_rfc3339();
        conn.execute(
            "UPDATE message_occurrences
             SET routed_at = ?2, route_error = NULL, state = 'routed', updated_at = ?2
             WHERE id = ?1",
            params![id, now],
        )
        .await?;
        Ok(())
    }

    pub async fn mark_failed(
        &self,
        id: &str,
        stage: PipelineStage,
        error: &str,
    ) -> Result<(), OccurrenceError> {
        let conn = self.db.connection().await?;
        conn.execute(
            &format!(
                "UPDATE message_occurrences
                 SET state = 'failed', {} = ?2, updated_at = ?3
                 WHERE id = ?1",
                stage.error_column()
            ),
            params![id, error, now_rfc3339()],
        )
        .await?;
        Ok(())
    }
}

fn row_to_occurrence(row: Row) -> Result<Occurrence, OccurrenceError> {
    let label_ids_json: String = row.get(7)?;
    let state_raw: String = row.get(8)?;
    let state = OccurrenceState::from_str(&state_raw)
        .ok_or_else(|| OccurrenceError::InvalidRow(format!("state {state_raw}")))?;
    let evidence_json: String = row.get(20)?;

    Ok(Occurrence {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        mailbox_id: row.get(2)?,
        provider_message_id: row.get(3)?,
        provider_thread_id: row.get(4)?,
        provider_history_id: row.get(5)?,
        internal_date: parse_timestamp(row.get(6)?),
        label_ids: serde_json::from_str(&label_ids_json)?,
        state,
        raw_blob_id: row.get(9)?,
        raw_fetch_error: row.get(10)?,
        message_id: row.get(11)?,
        parse_error: row.get(12)?,
        ticket_id: row.get(13)?,
        stitch_error: row.get(14)?,
        routed_at: parse_timestamp(row.get(15)?),
        route_error: row.get(16)?,
        original_recipient: row.get(17)?,
        original_recipient_source: row.get(18)?,
        original_recipient_confidence: row.get(19)?,
        original_recipient_evidence: serde_json::from_str(&evidence_json)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::recipient::resolve_original_recipient;
    use crate::testing::{seed_mailbox, seed_org, setup_db};

    fn discovered<'a>(org: &'a str, mailbox: &'a str, labels: &'a [String]) -> DiscoveredOccurrence<'a> {
        DiscoveredOccurrence {
            organization_id: org,
            mailbox_id: mailbox,
            provider_message_id: "gm-1",
            provider_thread_id: Some("thr-1"),
            provider_history_id: Some(10),
            internal_date: None,
            label_ids: labels,
        }
    }

    #[tokio::test]
    async fn rediscovery_refreshes_mirror_fields_but_not_state() {
        let (db, _dir) = setup_db().await;
        let org = seed_org(&db).await;
        let mailbox = seed_mailbox(&db, &org, "journal@acme.test").await;
        let repo = OccurrenceRepository::new(db.clone());

        let labels = vec!["INBOX".to_string()];
        let id = repo
            .upsert_discovered(discovered(&org, &mailbox, &labels))
            .await
            .expect("first upsert");

        let conn = db.connection().await.expect("conn");
        conn.execute(
            "INSERT INTO blobs (id, organization_id, kind, sha256, size_bytes, storage_key, created_at)
             VALUES ('b0', ?1, 'raw_eml', x'00', 1, 'k', '2026-01-01T00:00:00Z')",
            params![org.as_str()],
        )
        .await
        .expect("seed blob");
        repo.mark_raw_fetched(&id, "b0").await.expect("raw fetched");

        let labels2 = vec!["INBOX".to_string(), "UNREAD".to_string()];
        let mut rediscovered = discovered(&org, &mailbox, &labels2);
        rediscovered.provider_history_id = Some(22);
        let id_again = repo
            .upsert_discovered(rediscovered)
            .await
            .expect("second upsert");

        assert_eq!(id, id_again);
        let occurrence = repo.get(&id).await.expect("get").expect("present");
        assert_eq!(occurrence.provider_history_id, Some(22));
        assert_eq!(occurrence.label_ids, labels2);
        assert_eq!(occurrence.state, OccurrenceState::RawFetched);
    }

    #[tokio::test]
    async fn stage_marks_advance_state_and_clear_errors() {
        let (db, _dir) = setup_db().await;
        let org = seed_org(&db).await;
        let mailbox = seed_mailbox(&db, &org, "journal@acme.test").await;
        let repo = OccurrenceRepository::new(db.clone());

        let labels = Vec::new();
        let id = repo
            .upsert_discovered(discovered(&org, &mailbox, &labels))
            .await
            .expect("upsert");

        repo.mark_failed(&id, PipelineStage::RawFetch, "boom")
            .await
            .expect("fail");
        let occurrence = repo.get(&id).await.expect("get").expect("present");
        assert_eq!(occurrence.state, OccurrenceState::Failed);
        assert_eq!(occurrence.raw_fetch_error.as_deref(), Some("boom"));

        // Seed a blob row so the FK on raw_blob_id resolves.
        let conn = db.connection().await.expect("conn");
        conn.execute(
            "INSERT INTO blobs (id, organization_id, kind, sha256, size_bytes, storage_key, created_at)
             VALUES ('b1', ?1, 'raw_eml', x'00', 1, 'k', '2026-01-01T00:00:00Z')",
            params![org.as_str()],
        )
        .await
        .expect("seed blob");

        repo.mark_raw_fetched(&id, "b1").await.expect("raw fetched");
        let occurrence = repo.get(&id).await.expect("get").expect("present");
        assert_eq!(occurrence.state, OccurrenceState::RawFetched);
        assert!(occurrence.raw_fetch_error.is_none());
        assert_eq!(occurrence.raw_blob_id.as_deref(), Some("b1"));
    }

    #[tokio::test]
    async fn mark_parsed_stores_recipient_resolution() {
        let (db, _dir) = setup_db().await;
        let org = seed_org(&db).await;
        let mailbox = seed_mailbox(&db, &org, "journal@acme.test").await;
        let repo = OccurrenceRepository::new(db.clone());

        let labels = Vec::new();
        let id = repo
            .upsert_discovered(discovered(&org, &mailbox, &labels))
            .await
            .expect("upsert");

        let conn = db.connection().await.expect("conn");
        conn.execute(
            "INSERT INTO messages (id, organization_id, direction, fingerprint_v1, signature_v1, created_at, first_seen_at)
             VALUES ('m1', ?1, 'inbound', x'00', x'00', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            params![org.as_str()],
        )
        .await
        .expect("seed message");

        let mut headers = crate::ingest::parser::HeaderMap::new();
        headers.insert("Delivered-To".into(), vec!["d@acme.test".into()]);
        let resolution = resolve_original_recipient(&headers, &[], &[]);

        repo.mark_parsed(&id, "m1", &resolution)
            .await
            .expect("mark parsed");
        let occurrence = repo.get(&id).await.expect("get").expect("present");
        assert_eq!(occurrence.state, OccurrenceState::Parsed);
        assert_eq!(occurrence.message_id.as_deref(), Some("m1"));
        assert_eq!(occurrence.original_recipient.as_deref(), Some("d@acme.test"));
        assert_eq!(occurrence.original_recipient_source, "delivered_to");
        assert_eq!(occurrence.original_recipient_confidence, "medium");
        assert_eq!(
            occurrence.original_recipient_evidence["selected_from"],
            "Delivered-To"
        );
    }

    #[test]
    fn state_gates_compare_by_pipeline_position() {
        assert!(OccurrenceState::Routed.reached(OccurrenceState::Parsed));
        assert!(OccurrenceState::Parsed.reached(OccurrenceState::Parsed));
        assert!(!OccurrenceState::Discovered.reached(OccurrenceState::RawFetched));
        assert!(!OccurrenceState::Failed.reached(OccurrenceState::Discovered));
    }
}
