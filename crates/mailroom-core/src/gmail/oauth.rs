use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

pub const AUTHORIZE_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const GMAIL_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token response decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("token endpoint error {status}: {body}")]
    TokenEndpoint { status: u16, body: String },
    #[error(
        "Google did not return a refresh token; revoke the app's access at \
         https://myaccount.google.com/permissions and connect the mailbox again"
    )]
    MissingRefreshToken,
    #[error("invalid expires_in value: {0}")]
    InvalidExpires(i64),
    #[error("invalid authorization endpoint: {0}")]
    InvalidEndpoint(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GoogleTokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl GoogleTokenResponse {
    /// Google returns granted scopes as one space-delimited string.
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or("")
            .split(' ')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }
}

/// The consent URL the operator visits to connect a journal mailbox.
/// `access_type=offline` + `prompt=consent` force a refresh token grant.
pub fn build_authorization_url(
    client_id: &str,
    redirect_uri: &str,
    scopes: &[&str],
    state: &str,
) -> Result<String, OAuthError> {
    let url = Url::parse_with_params(
        AUTHORIZE_ENDPOINT,
        &[
            ("client_id", client_id),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", scopes.join(" ").as_str()),
            ("state", state),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("include_granted_scopes", "true"),
        ],
    )
    .map_err(|err| OAuthError::InvalidEndpoint(err.to_string()))?;
    Ok(url.to_string())
}

/// Exchange an authorization code. A response without a refresh token is
/// rejected outright; without one the mailbox cannot be synced unattended.
pub async fn exchange_code_for_tokens(
    http: &reqwest::Client,
    endpoint: &str,
    code: &str,
    client_id: &str,
    client_secret: &str,
    redirect_uri: &str,
) -> Result<GoogleTokenResponse, OAuthError> {
    let response = http
        .post(endpoint)
        .form(&[
            ("code", code),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
        ])
        .send()
        .await?;

    let token = decode_token_response(response).await?;
    if token.refresh_token.as_deref().unwrap_or("").is_empty() {
        return Err(OAuthError::MissingRefreshToken);
    }
    Ok(token)
}

/// Trade a refresh token for a fresh access token.
pub async fn refresh_access_token(
    http: &reqwest::Client,
    endpoint: &str,
    refresh_token: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<GoogleTokenResponse, OAuthError> {
    let response = http
        .post(endpoint)
        .form(&[
            ("refresh_token", refresh_token),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .await?;

    decode_token_response(response).await
}

async fn decode_token_response(
    response: reqwest::Response,
) -> Result<GoogleTokenResponse, OAuthError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(OAuthError::TokenEndpoint {
            status: status.as_u16(),
            body,
        });
    }

    let body = response.text().await?;
    let token: GoogleTokenResponse = serde_json::from_str(&body).map_err(OAuthError::Decode)?;
    if token.expires_in <= 0 {
        return Err(OAuthError::InvalidExpires(token.expires_in));
    }
    Ok(token)
}
