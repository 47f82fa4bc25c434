pub mod client;
pub mod oauth;
pub mod types;

pub use client::{DEFAULT_API_BASE, GmailClient, GmailError};
pub use oauth::{
    AUTHORIZE_ENDPOINT, GMAIL_READONLY_SCOPE, GoogleTokenResponse, OAuthError, TOKEN_ENDPOINT,
    build_authorization_url, exchange_code_for_tokens, refresh_access_token,
};
pub use types::{
    HistoryMessageChange, HistoryRecord, ListHistoryResponse, ListMessagesResponse, MessageId,
    Profile, RawMessage,
};
