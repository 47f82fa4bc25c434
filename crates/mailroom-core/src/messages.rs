use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_timestamp, to_rfc3339};
use crate::ingest::parser::{HeaderMap, ParsedAttachment, ParsedEmail};

pub const PARSER_VERSION: i64 = 1;
const SNIPPET_MAX_CHARS: usize = 280;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Inbound => "inbound",
            MessageDirection::Outbound => "outbound",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CanonicalMessage {
    pub id: String,
    pub organization_id: String,
    pub direction: String,
    pub oss_message_id: Option<String>,
    pub rfc_message_id: Option<String>,
    pub fingerprint_v1: Vec<u8>,
    pub signature_v1: Vec<u8>,
    pub collision_group_id: Option<String>,
    pub first_seen_at: Option<DateTime<Utc>>,
}

/// Identity inputs for one canonical message resolution.
#[derive(Debug, Clone)]
pub struct CanonicalIdentity<'a> {
    pub organization_id: &'a str,
    pub direction: MessageDirection,
    pub oss_message_id: Option<Uuid>,
    pub rfc_message_id: Option<&'a str>,
    pub fingerprint_v1: &'a [u8; 32],
    pub signature_v1: &'a [u8; 32],
}

/// Latest stored parse projection, as stitching needs it.
#[derive(Debug, Clone)]
pub struct StoredContent {
    pub subject: Option<String>,
    pub subject_norm: Option<String>,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub reply_to_emails: Vec<String>,
    pub date_header: Option<DateTime<Utc>>,
    pub headers: HeaderMap,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message not found: {0}")]
    NotFound(String),
    #[error("canonical resolution failed for organization {0}")]
    ResolutionFailed(String),
}

#[derive(Clone)]
pub struct MessageRepository {
    db: Database,
}

impl MessageRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Resolve identity to one canonical `messages` row: by oss id (outbound
    /// mirrors), then by fingerprint+signature, then by inserting a new row
    /// plus its lookup entries. Collision-group assignment happens with the
    /// insert so concurrent writers converge.
    pub async fn upsert_canonical(
        &self,
        identity: CanonicalIdentity<'_>,
    ) -> Result<String, MessageError> {
        let conn = self.db.connection().await?;

        if let Some(found) = self.resolve_existing(&conn, &identity).await? {
            return Ok(found);
        }

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let oss = identity.oss_message_id.map(|u| u.to_string());

        let mut rows = conn
            .query(
                "INSERT OR IGNORE INTO messages (id, organization_id, direction, oss_message_id, rfc_message_id, fingerprint_v1, signature_v1, created_at, first_seen_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 RETURNING id",
                params![
                    id.clone(),
                    identity.organization_id,
                    identity.direction.as_str(),
                    oss.clone(),
                    identity.rfc_message_id.map(|s| s.to_string()),
                    identity.fingerprint_v1.to_vec(),
                    identity.signature_v1.to_vec(),
                    now.clone()
                ],
            )
            .await?;

        let inserted = rows.next().await?.is_some();
        if !inserted {
            // Lost a race on the unique oss index; the winner's row resolves.
            return match self.resolve_existing(&conn, &identity).await? {
                Some(found) => Ok(found),
                None => Err(MessageError::ResolutionFailed(
                    identity.organization_id.to_string(),
                )),
            };
        }

        conn.execute(
            "INSERT OR IGNORE INTO message_fingerprints (organization_id, fingerprint_version, fingerprint, signature_v1, message_id, created_at)
             VALUES (?1, 1, ?2, ?3, ?4, ?5)",
            params![
                identity.organization_id,
                identity.fingerprint_v1.to_vec(),
                identity.signature_v1.to_vec(),
                id.clone(),
                now.clone()
            ],
        )
        .await?;

        if let Some(rfc_message_id) = identity.rfc_message_id {
            conn.execute(
                "INSERT OR IGNORE INTO message_rfc_ids (organization_id, rfc_message_id, signature_v1, message_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    identity.organization_id,
                    rfc_message_id,
                    identity.signature_v1.to_vec(),
                    id.clone(),
                    now.clone()
                ],
            )
            .await?;
        }

        if let Some(oss_message_id) = oss {
            conn.execute(
                "INSERT OR IGNORE INTO message_oss_ids (organization_id, oss_message_id, message_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    identity.organization_id,
                    oss_message_id,
                    id.clone(),
                    now
                ],
            )
            .await?;
        }

        assign_collision_group(&conn, identity.organization_id, identity.fingerprint_v1).await?;

        Ok(id)
    }

    async fn resolve_existing(
        &self,
        conn: &Connection,
        identity: &CanonicalIdentity<'_>,
    ) -> Result<Option<String>, MessageError> {
        if let Some(oss_message_id) = identity.oss_message_id {
            let mut rows = conn
                .query(
                    "SELECT message_id FROM message_oss_ids
                     WHERE organization_id = ?1 AND oss_message_id = ?2",
                    params![identity.organization_id, oss_message_id.to_string()],
                )
                .await?;
            if let Some(row) = rows.next().await? {
                return Ok(Some(row.get(0)?));
            }
        }

        let mut rows = conn
            .query(
                "SELECT message_id FROM message_fingerprints
                 WHERE organization_id = ?1 AND fingerprint_version = 1
                   AND fingerprint = ?2 AND signature_v1 = ?3",
                params![
                    identity.organization_id,
                    identity.fingerprint_v1.to_vec(),
                    identity.signature_v1.to_vec()
                ],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub async fn get(
        &self,
        organization_id: &str,
        id: &str,
    ) -> Result<CanonicalMessage, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT id, organization_id, direction, oss_message_id, rfc_message_id, fingerprint_v1, signature_v1, collision_group_id, first_seen_at
                 FROM messages WHERE organization_id = ?1 AND id = ?2",
                params![organization_id, id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(CanonicalMessage {
                id: row.get(0)?,
                organization_id: row.get(1)?,
                direction: row.get(2)?,
                oss_message_id: row.get(3)?,
                rfc_message_id: row.get(4)?,
                fingerprint_v1: row.get(5)?,
                signature_v1: row.get(6)?,
                collision_group_id: row.get(7)?,
                first_seen_at: parse_timestamp(row.get(8)?),
            }),
            None => Err(MessageError::NotFound(id.to_string())),
        }
    }

    /// Map an RFC message-id reference back to a canonical message,
    /// whichever signature observed it first.
    pub async fn lookup_by_rfc_id(
        &self,
        organization_id: &str,
        rfc_message_id: &str,
    ) -> Result<Option<String>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT message_id FROM message_rfc_ids
                 WHERE organization_id = ?1 AND rfc_message_id = ?2
                 ORDER BY created_at ASC LIMIT 1",
                params![organization_id, rfc_message_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Store the parse projection as the next content version.
    pub async fn insert_content(
        &self,
        organization_id: &str,
        message_id: &str,
        parsed: &ParsedEmail,
    ) -> Result<i64, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT COALESCE(MAX(content_version), 0) FROM message_contents
                 WHERE organization_id = ?1 AND message_id = ?2",
                params![organization_id, message_id],
            )
            .await?;
        let max_version: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        let content_version = max_version + 1;

        let snippet: Option<String> = parsed
            .body_text
            .as_deref()
            .or(parsed.subject.as_deref())
            .map(|text| text.chars().take(SNIPPET_MAX_CHARS).collect::<String>())
            .filter(|text: &String| !text.is_empty());

        conn.execute(
            "INSERT OR IGNORE INTO message_contents (
                id, organization_id, message_id, content_version, parser_version, parsed_at,
                date_header, subject, subject_norm, from_email, from_name,
                reply_to_emails, to_emails, cc_emails, headers_json,
                body_text, body_html_sanitized, has_attachments, attachment_count, snippet)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                Uuid::new_v4().to_string(),
                organization_id,
                message_id,
                content_version,
                PARSER_VERSION,
                now_rfc3339(),
                parsed.date.map(to_rfc3339),
                parsed.subject.clone(),
                parsed.subject_norm.clone(),
                parsed.from_email.clone(),
                parsed.from_name.clone(),
                serde_json::to_string(&parsed.reply_to_emails)?,
                serde_json::to_string(&parsed.to_emails)?,
                serde_json::to_string(&parsed.cc_emails)?,
                serde_json::to_string(&parsed.headers)?,
                parsed.body_text.clone(),
                parsed.body_html_sanitized.clone(),
                if parsed.attachments.is_empty() { 0i64 } else { 1i64 },
                parsed.attachments.len() as i64,
                snippet
            ],
        )
        .await?;

        Ok(content_version)
    }

    pub async fn latest_content(
        &self,
        organization_id: &str,
        message_id: &str,
    ) -> Result<Option<StoredContent>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT subject, subject_norm, from_email, from_name, reply_to_emails, date_header, headers_json
                 FROM message_contents
                 WHERE organization_id = ?1 AND message_id = ?2
                 ORDER BY content_version DESC LIMIT 1",
                params![organization_id, message_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        let reply_to_json: String = row.get(4)?;
        let headers_json: String = row.get(6)?;

        Ok(Some(StoredContent {
            subject: row.get(0)?,
            subject_norm: row.get(1)?,
            from_email: row.get(2)?,
            from_name: row.get(3)?,
            reply_to_emails: serde_json::from_str(&reply_to_json)?,
            date_header: parse_timestamp(row.get(5)?),
            headers: serde_json::from_str(&headers_json)?,
        }))
    }

    pub async fn insert_thread_refs(
        &self,
        organization_id: &str,
        message_id: &str,
        in_reply_to: Option<&str>,
        references: &[String],
    ) -> Result<(), MessageError> {
        let conn = self.db.connection().await?;
        if let Some(in_reply_to) = in_reply_to {
            conn.execute(
                "INSERT OR IGNORE INTO message_thread_refs (id, organization_id, message_id, ref_type, ref_rfc_message_id, created_at)
                 VALUES (?1, ?2, ?3, 'in_reply_to', ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    organization_id,
                    message_id,
                    in_reply_to,
                    now_rfc3339()
                ],
            )
            .await?;
        }
        for reference in references {
            conn.execute(
                "INSERT OR IGNORE INTO message_thread_refs (id, organization_id, message_id, ref_type, ref_rfc_message_id, created_at)
                 VALUES (?1, ?2, ?3, 'references', ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    organization_id,
                    message_id,
                    reference.as_str(),
                    now_rfc3339()
                ],
            )
            .await?;
        }
        Ok(())
    }

    /// Thread refs of one message, `in_reply_to` entries first.
    pub async fn thread_refs(
        &self,
        organization_id: &str,
        message_id: &str,
    ) -> Result<Vec<(String, String)>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT ref_type, ref_rfc_message_id FROM message_thread_refs
                 WHERE organization_id = ?1 AND message_id = ?2
                 ORDER BY CASE ref_type WHEN 'in_reply_to' THEN 0 ELSE 1 END, created_at ASC, id ASC",
                params![organization_id, message_id],
            )
            .await?;

        let mut refs = Vec::new();
        while let Some(row) = rows.next().await? {
            refs.push((row.get(0)?, row.get(1)?));
        }
        Ok(refs)
    }

    pub async fn insert_attachment(
        &self,
        organization_id: &str,
        message_id: &str,
        blob_id: &str,
        attachment: &ParsedAttachment,
        sha256: &[u8; 32],
    ) -> Result<(), MessageError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "INSERT OR IGNORE INTO message_attachments (id, organization_id, message_id, blob_id, filename, content_type, size_bytes, sha256, is_inline, content_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                Uuid::new_v4().to_string(),
                organization_id,
                message_id,
                blob_id,
                attachment.filename.clone(),
                attachment.content_type.clone(),
                attachment.payload.len() as i64,
                sha256.to_vec(),
                attachment.is_inline as i64,
                attachment.content_id.clone(),
                now_rfc3339()
            ],
        )
        .await?;
        Ok(())
    }

    /// One-shot repair for rows created before collision tagging existed:
    /// scan fingerprint groups with more than one signature and tag every
    /// member. Safe to re-run; returns how many messages were tagged.
    pub async fn backfill_collision_groups(&self) -> Result<u64, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT organization_id, fingerprint FROM message_fingerprints
                 WHERE fingerprint_version = 1
                 GROUP BY organization_id, fingerprint
                 HAVING COUNT(DISTINCT signature_v1) >= 2",
                (),
            )
            .await?;

        let mut groups: Vec<(String, Vec<u8>)> = Vec::new();
        while let Some(row) = rows.next().await? {
            groups.push((row.get(0)?, row.get(1)?));
        }

        let mut tagged = 0;
        for (organization_id, fingerprint) in groups {
            tagged += assign_collision_group_raw(&conn, &organization_id, &fingerprint).await?;
        }
        Ok(tagged)
    }
}

async fn assign_collision_group(
    conn: &Connection,
    organization_id: &str,
    fingerprint: &[u8; 32],
) -> Result<u64, MessageError> {
    assign_collision_group_raw(conn, organization_id, fingerprint.as_slice()).await
}

/// Tag every message sharing this fingerprint once at least two distinct
/// signatures exist. An existing group id is reused so later members join
/// the same group.
async fn assign_collision_group_raw(
    conn: &Connection,
    organization_id: &str,
    fingerprint: &[u8],
) -> Result<u64, MessageError> {
    let mut rows = conn
        .query(
            "SELECT id, signature_v1, collision_group_id FROM messages
             WHERE organization_id = ?1 AND fingerprint_v1 = ?2
             ORDER BY created_at ASC, id ASC",
            params![organization_id, fingerprint.to_vec()],
        )
        .await?;

    let mut signatures: Vec<Vec<u8>> = Vec::new();
    let mut existing_group: Option<String> = None;
    let mut untagged = false;
    while let Some(row) = rows.next().await? {
        let signature: Vec<u8> = row.get(1)?;
        if !signatures.contains(&signature) {
            signatures.push(signature);
        }
        let group: Option<String> = row.get(2)?;
        match group {
            Some(group) if existing_group.is_none() => existing_group = Some(group),
            Some(_) => {}
            None => untagged = true,
        }
    }

    if signatures.len() < 2 || !untagged {
        return Ok(0);
    }

    let group_id = existing_group.unwrap_or_else(|| Uuid::new_v4().to_string());
    let tagged = conn
        .execute(
            "UPDATE messages SET collision_group_id = ?3
             WHERE organization_id = ?1 AND fingerprint_v1 = ?2 AND collision_group_id IS NULL",
            params![organization_id, fingerprint.to_vec(), group_id],
        )
        .await?;
    Ok(tagged)
}
