use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::gmail::types::{ListHistoryResponse, ListMessagesResponse, Profile, RawMessage};

pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

const MAX_PAGE_SIZE: u32 = 500;

#[derive(Debug, Error)]
pub enum GmailError {
    #[error("gmail history id is invalid or expired")]
    HistoryExpired,
    #[error("gmail api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl GmailError {
    pub fn status(&self) -> Option<u16> {
        match self {
            GmailError::Api { status, .. } => Some(*status),
            GmailError::HistoryExpired => Some(404),
            _ => None,
        }
    }
}

/// Thin typed wrapper over the journal account's Gmail REST surface. The
/// caller resolves an access token first (see `credentials`); one client
/// instance serves one sync pass.
pub struct GmailClient {
    http: Client,
    api_base: String,
    access_token: String,
}

impl GmailClient {
    pub fn new(http: Client, access_token: impl Into<String>) -> Self {
        Self {
            http,
            api_base: DEFAULT_API_BASE.to_string(),
            access_token: access_token.into(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub async fn get_profile(&self) -> Result<Profile, GmailError> {
        let url = format!("{}/profile", self.api_base);
        self.send_json(self.http.get(&url), "Gmail profile lookup failed")
            .await
    }

    /// One page of the full mailbox listing; spam and trash folders are
    /// always included so journal replicas are observed.
    pub async fn list_messages(
        &self,
        page_token: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<ListMessagesResponse, GmailError> {
        let url = format!("{}/messages", self.api_base);
        let mut builder = self
            .http
            .get(&url)
            .query(&[("includeSpamTrash", "true")])
            .query(&[("maxResults", clamp_page_size(max_results))]);
        if let Some(token) = page_token {
            builder = builder.query(&[("pageToken", token)]);
        }
        self.send_json(builder, "Gmail message list failed").await
    }

    pub async fn get_message_raw(&self, message_id: &str) -> Result<RawMessage, GmailError> {
        let url = format!("{}/messages/{}", self.api_base, message_id);
        let builder = self.http.get(&url).query(&[("format", "raw")]);
        let message: RawMessage = self
            .send_json(builder, "Gmail raw message fetch failed")
            .await?;
        if message.raw.as_deref().unwrap_or("").is_empty() {
            return Err(GmailError::Api {
                status: 502,
                message: "Gmail raw message payload missing raw body".to_string(),
            });
        }
        Ok(message)
    }

    /// One page of `messageAdded` history starting after the given watermark.
    /// A 404 means the watermark is too old and the caller must backfill.
    pub async fn list_history(
        &self,
        start_history_id: i64,
        page_token: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<ListHistoryResponse, GmailError> {
        let url = format!("{}/history", self.api_base);
        let mut builder = self
            .http
            .get(&url)
            .query(&[("startHistoryId", start_history_id.to_string())])
            .query(&[("historyTypes", "messageAdded")])
            .query(&[("maxResults", clamp_page_size(max_results))]);
        if let Some(token) = page_token {
            builder = builder.query(&[("pageToken", token)]);
        }

        let response = builder.bearer_auth(&self.access_token).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(GmailError::HistoryExpired);
        }
        decode_response(response, "Gmail history list failed").await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        default_message: &str,
    ) -> Result<T, GmailError> {
        let response = builder.bearer_auth(&self.access_token).send().await?;
        decode_response(response, default_message).await
    }
}

fn clamp_page_size(max_results: Option<u32>) -> String {
    max_results
        .unwrap_or(100)
        .clamp(1, MAX_PAGE_SIZE)
        .to_string()
}

async fn decode_response<T: DeserializeOwned>(
    response: reqwest::Response,
    default_message: &str,
) -> Result<T, GmailError> {
    let status = response.status();
    let body = response.text().await?;

    if status.is_client_error() || status.is_server_error() {
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|payload| {
                payload
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .map(|m| m.to_string())
            })
            .unwrap_or_else(|| default_message.to_string());
        return Err(GmailError::Api {
            status: status.as_u16(),
            message,
        });
    }

    serde_json::from_str(&body).map_err(GmailError::Decode)
}
