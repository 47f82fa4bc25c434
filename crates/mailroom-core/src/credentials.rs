use chrono::{DateTime, Duration, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::TokenCipher;
use crate::db::{Database, DbError, now_rfc3339, parse_timestamp, to_rfc3339};
use crate::gmail::oauth::{self, OAuthError};

const CREDENTIAL_COLUMNS: &str = "id, organization_id, provider, subject, scopes, encrypted_refresh_token, encrypted_access_token, access_token_expires_at, created_at, updated_at";

/// Cached access tokens are considered stale this close to expiry.
const ACCESS_TOKEN_EXPIRY_SLACK: Duration = Duration::seconds(30);

#[derive(Debug, Clone)]
pub struct OAuthCredential {
    pub id: String,
    pub organization_id: String,
    pub provider: String,
    pub subject: String,
    pub scopes: Vec<String>,
    pub encrypted_refresh_token: Vec<u8>,
    pub encrypted_access_token: Option<Vec<u8>>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("credential not found: {0}")]
    NotFound(String),
    #[error("credential unavailable: stored refresh token cannot be decrypted")]
    CredentialUnavailable,
    #[error("oauth error: {0}")]
    OAuth(#[from] OAuthError),
    #[error("crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

#[derive(Clone)]
pub struct CredentialRepository {
    db: Database,
}

/// AAD binds a sealed token to the credential row it belongs to, so a
/// ciphertext copied between rows or tenants refuses to decrypt.
pub fn credential_aad(organization_id: &str, provider: &str, subject: &str) -> Vec<u8> {
    format!("oauth_credentials:{organization_id}:{provider}:{subject}").into_bytes()
}

impl CredentialRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a freshly-granted credential. Reconnecting the same subject
    /// replaces the stored refresh token and scopes.
    pub async fn upsert(
        &self,
        organization_id: &str,
        provider: &str,
        subject: &str,
        scopes: &[String],
        refresh_token: &str,
        cipher: &TokenCipher,
    ) -> Result<OAuthCredential, CredentialError> {
        let aad = credential_aad(organization_id, provider, subject);
        let sealed = cipher.seal(refresh_token.as_bytes(), &aad)?;
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let scopes_json = serde_json::to_string(scopes)?;

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO oauth_credentials (id, organization_id, provider, subject, scopes, encrypted_refresh_token, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                     ON CONFLICT (organization_id, provider, subject) DO UPDATE SET
                        scopes = excluded.scopes,
                        encrypted_refresh_token = excluded.encrypted_refresh_token,
                        encrypted_access_token = NULL,
                        access_token_expires_at = NULL,
                        updated_at = excluded.updated_at
                     RETURNING {CREDENTIAL_COLUMNS}"
                ),
                params![id, organization_id, provider, subject, scopes_json, sealed, now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_credential(row),
            None => Err(CredentialError::NotFound(subject.to_string())),
        }
    }

    pub async fn get(
        &self,
        organization_id: &str,
        id: &str,
    ) -> Result<OAuthCredential, CredentialError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CREDENTIAL_COLUMNS} FROM oauth_credentials
                     WHERE organization_id = ?1 AND id = ?2"
                ),
                params![organization_id, id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_to_credential(row),
            None => Err(CredentialError::NotFound(id.to_string())),
        }
    }

    /// Return a live access token for the credential. The cached token is
    /// used while it has more than 30 seconds of life left; a cached token
    /// that fails to decrypt silently falls through to a fresh refresh.
    /// An undecryptable refresh token is terminal for this call and the
    /// caller surfaces degraded connectivity instead of aborting the sync.
    #[allow(clippy::too_many_arguments)]
    pub async fn access_token(
        &self,
        organization_id: &str,
        credential_id: &str,
        cipher: &TokenCipher,
        http: &reqwest::Client,
        token_endpoint: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<String, CredentialError> {
        let credential = self.get(organization_id, credential_id).await?;
        let aad = credential_aad(organization_id, &credential.provider, &credential.subject);

        let refresh_token = cipher
            .open(&credential.encrypted_refresh_token, &aad)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or(CredentialError::CredentialUnavailable)?;

        let now = Utc::now();
        if let (Some(sealed), Some(expires_at)) = (
            credential.encrypted_access_token.as_deref(),
            credential.access_token_expires_at,
        ) {
            if expires_at > now + ACCESS_TOKEN_EXPIRY_SLACK {
                if let Ok(bytes) = cipher.open(sealed, &aad) {
                    if let Ok(token) = String::from_utf8(bytes) {
                        return Ok(token);
                    }
                }
            }
        }

        let token = oauth::refresh_access_token(
            http,
            token_endpoint,
            &refresh_token,
            client_id,
            client_secret,
        )
        .await?;

        let sealed = cipher.seal(token.access_token.as_bytes(), &aad)?;
        let expires_at = now + Duration::seconds(token.expires_in.max(1));
        let conn = self.db.connection().await?;
        conn.execute(
            "UPDATE oauth_credentials
             SET encrypted_access_token = ?3, access_token_expires_at = ?4, updated_at = ?5
             WHERE organization_id = ?1 AND id = ?2",
            params![
                organization_id,
                credential_id,
                sealed,
                to_rfc3339(expires_at),
                now_rfc3339()
            ],
        )
        .await?;

        Ok(token.access_token)
    }
}

fn row_to_credential(row: Row) -> Result<OAuthCredential, CredentialError> {
    let scopes_json: String = row.get(4)?;
    let scopes: Vec<String> = serde_json::from_str(&scopes_json)?;

    Ok(OAuthCredential {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        provider: row.get(2)?,
        subject: row.get(3)?,
        scopes,
        encrypted_refresh_token: row.get(5)?,
        encrypted_access_token: row.get(6)?,
        access_token_expires_at: parse_timestamp(row.get(7)?),
        created_at: parse_timestamp(row.get(8)?)
            .ok_or_else(|| CredentialError::NotFound("created_at".into()))?,
        updated_at: parse_timestamp(row.get(9)?)
            .ok_or_else(|| CredentialError::NotFound("updated_at".into()))?,
    })
}
