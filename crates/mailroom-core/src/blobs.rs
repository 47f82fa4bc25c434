use libsql::params;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339};
use crate::ingest::fingerprint::hex_encode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    RawEml,
    Attachment,
}

impl BlobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobKind::RawEml => "raw_eml",
            BlobKind::Attachment => "attachment",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlobRecord {
    pub id: String,
    pub organization_id: String,
    pub kind: String,
    pub sha256: Vec<u8>,
    pub size_bytes: i64,
    pub storage_key: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("blob not found: {0}")]
    NotFound(String),
}

/// Storage key for a raw message body: `<tenant>/raw_eml/<sha256-hex>.eml`.
pub fn raw_eml_key(organization_id: &str, sha256: &[u8; 32]) -> String {
    format!("{organization_id}/raw_eml/{}.eml", hex_encode(sha256))
}

/// Storage key for an attachment payload: `<tenant>/attachments/<sha256-hex>`.
pub fn attachment_key(organization_id: &str, sha256: &[u8; 32]) -> String {
    format!("{organization_id}/attachments/{}", hex_encode(sha256))
}

#[derive(Clone)]
pub struct BlobRepository {
    db: Database,
}

impl BlobRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a content-addressed blob. Re-registering the same content
    /// refreshes only the storage key, so repeated fetches are idempotent.
    pub async fn upsert(
        &self,
        organization_id: &str,
        kind: BlobKind,
        sha256: &[u8; 32],
        size_bytes: u64,
        storage_key: &str,
        content_type: Option<&str>,
    ) -> Result<String, BlobError> {
        let id = Uuid::new_v4().to_string();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "INSERT INTO blobs (id, organization_id, kind, sha256, size_bytes, storage_key, content_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (organization_id, kind, sha256) DO UPDATE SET storage_key = excluded.storage_key
                 RETURNING id",
                params![
                    id,
                    organization_id,
                    kind.as_str(),
                    sha256.to_vec(),
                    size_bytes as i64,
                    storage_key,
                    content_type.map(|s| s.to_string()),
                    now_rfc3339()
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Err(BlobError::NotFound("upsert returned no row".into())),
        }
    }

    pub async fn get(&self, organization_id: &str, id: &str) -> Result<BlobRecord, BlobError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT id, organization_id, kind, sha256, size_bytes, storage_key, content_type
                 FROM blobs WHERE organization_id = ?1 AND id = ?2",
                params![organization_id, id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(BlobRecord {
                id: row.get(0)?,
                organization_id: row.get(1)?,
                kind: row.get(2)?,
                sha256: row.get(3)?,
                size_bytes: row.get(4)?,
                storage_key: row.get(5)?,
                content_type: row.get(6)?,
            }),
            None => Err(BlobError::NotFound(id.to_string())),
        }
    }
}
