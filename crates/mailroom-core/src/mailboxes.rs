use chrono::{DateTime, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_timestamp, to_rfc3339};

const MAILBOX_COLUMNS: &str = "id, organization_id, purpose, provider, email_address, display_name, oauth_credential_id, is_enabled, ingestion_paused_until, ingestion_pause_reason, gmail_history_id, last_incremental_sync_at, last_full_sync_at, last_sync_error, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxPurpose {
    Journal,
    User,
}

impl MailboxPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            MailboxPurpose::Journal => "journal",
            MailboxPurpose::User => "user",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "journal" => Some(MailboxPurpose::Journal),
            "user" => Some(MailboxPurpose::User),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Mailbox {
    pub id: String,
    pub organization_id: String,
    pub purpose: MailboxPurpose,
    pub provider: String,
    pub email_address: String,
    pub display_name: Option<String>,
    pub oauth_credential_id: String,
    pub is_enabled: bool,
    pub ingestion_paused_until: Option<DateTime<Utc>>,
    pub ingestion_pause_reason: Option<String>,
    pub gmail_history_id: Option<i64>,
    pub last_incremental_sync_at: Option<DateTime<Utc>>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMailbox {
    pub organization_id: String,
    pub purpose: MailboxPurpose,
    pub email_address: String,
    pub display_name: Option<String>,
    pub oauth_credential_id: String,
}

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("mailbox not found: {0}")]
    NotFound(String),
    #[error("invalid mailbox row: {0}")]
    InvalidRow(String),
}

#[derive(Clone)]
pub struct MailboxRepository {
    db: Database,
}

impl MailboxRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, new: NewMailbox) -> Result<Mailbox, MailboxError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO mailboxes (id, organization_id, purpose, provider, email_address, display_name, oauth_credential_id, is_enabled, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 'gmail', ?4, ?5, ?6, 1, ?7, ?7)
                     RETURNING {MAILBOX_COLUMNS}"
                ),
                params![
                    id,
                    new.organization_id,
                    new.purpose.as_str(),
                    new.email_address,
                    new.display_name,
                    new.oauth_credential_id,
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_mailbox(row),
            None => Err(MailboxError::InvalidRow("insert returned no row".into())),
        }
    }

    pub async fn get(&self, organization_id: &str, id: &str) -> Result<Mailbox, MailboxError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE organization_id = ?1 AND id = ?2"
                ),
                params![organization_id, id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_to_mailbox(row),
            None => Err(MailboxError::NotFound(id.to_string())),
        }
    }

    /// Load a mailbox only if it is currently eligible for sync work:
    /// present, enabled, and not inside an ingestion pause window.
    pub async fn load_for_sync(
        &self,
        organization_id: &str,
        id: &str,
    ) -> Result<Option<Mailbox>, MailboxError> {
        let mailbox = match self.get(organization_id, id).await {
            Ok(mailbox) => mailbox,
            Err(MailboxError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };

        if !mailbox.is_enabled {
            return Ok(None);
        }
        if let Some(paused_until) = mailbox.ingestion_paused_until {
            if paused_until > Utc::now() {
                return Ok(None);
            }
        }
        Ok(Some(mailbox))
    }

    pub async fn pause_ingestion(
        &self,
        organization_id: &str,
        id: &str,
        until: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), MailboxError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "UPDATE mailboxes
             SET ingestion_paused_until = ?3, ingestion_pause_reason = ?4, updated_at = ?5
             WHERE organization_id = ?1 AND id = ?2",
            params![
                organization_id,
                id,
                to_rfc3339(until),
                reason,
                now_rfc3339()
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn resume_ingestion(
        &self,
        organization_id: &str,
        id: &str,
    ) -> Result<(), MailboxError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "UPDATE mailboxes
             SET ingestion_paused_until = NULL, ingestion_pause_reason = NULL, updated_at = ?3
             WHERE organization_id = ?1 AND id = ?2",
            params![organization_id, id, now_rfc3339()],
        )
        .await?;
        Ok(())
    }

    /// Record a completed full backfill: advance the history watermark
    /// monotonically, stamp `last_full_sync_at`, clear the error.
    pub async fn record_backfill_complete(
        &self,
        organization_id: &str,
        id: &str,
        highest_history_id: Option<i64>,
    ) -> Result<(), MailboxError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "UPDATE mailboxes
             SET last_full_sync_at = ?3,
                 gmail_history_id = CASE WHEN ?4 IS NULL THEN gmail_history_id
                                         ELSE MAX(COALESCE(gmail_history_id, 0), ?4) END,
                 last_sync_error = NULL,
                 updated_at = ?3
             WHERE organization_id = ?1 AND id = ?2",
            params![organization_id, id, now_rfc3339(), highest_history_id],
        )
        .await?;
        Ok(())
    }

    pub async fn record_incremental_complete(
        &self,
        organization_id: &str,
        id: &str,
        highest_history_id: Option<i64>,
    ) -> Result<(), MailboxError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "UPDATE mailboxes
             SET last_incremental_sync_at = ?3,
                 gmail_history_id = CASE WHEN ?4 IS NULL THEN gmail_history_id
                                         ELSE MAX(COALESCE(gmail_history_id, 0), ?4) END,
                 last_sync_error = NULL,
                 updated_at = ?3
             WHERE organization_id = ?1 AND id = ?2",
            params![organization_id, id, now_rfc3339(), highest_history_id],
        )
        .await?;
        Ok(())
    }

    pub async fn record_sync_error(
        &self,
        organization_id: &str,
        id: &str,
        error: &str,
    ) -> Result<(), MailboxError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "UPDATE mailboxes SET last_sync_error = ?3, updated_at = ?4
             WHERE organization_id = ?1 AND id = ?2",
            params![organization_id, id, error, now_rfc3339()],
        )
        .await?;
        Ok(())
    }
}

fn row_to_mailbox(row: Row) -> Result<Mailbox, MailboxError> {
    let purpose_raw: String = row.get(2)?;
    let purpose = MailboxPurpose::from_str(&purpose_raw)
        .ok_or_else(|| MailboxError::InvalidRow(format!("purpose {purpose_raw}")))?;
    let is_enabled: i64 = row.get(7)?;

    Ok(Mailbox {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        purpose,
        provider: row.get(3)?,
        email_address: row.get(4)?,
        display_name: row.get(5)?,
        oauth_credential_id: row.get(6)?,
        is_enabled: is_enabled != 0,
        ingestion_paused_until: parse_timestamp(row.get(8)?),
        ingestion_pause_reason: row.get(9)?,
        gmail_history_id: row.get(10)?,
        last_incremental_sync_at: parse_timestamp(row.get(11)?),
        last_full_sync_at: parse_timestamp(row.get(12)?),
        last_sync_error: row.get(13)?,
        created_at: parse_timestamp(row.get(14)?)
            .ok_or_else(|| MailboxError::InvalidRow("created_at".into()))?,
        updated_at: parse_timestamp(row.get(15)?)
            .ok_or_else(|| MailboxError::InvalidRow("updated_at".into()))?,
    })
}
