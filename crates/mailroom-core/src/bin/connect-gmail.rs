//! Operator bootstrap: run the Google consent flow on a loopback listener,
//! persist the encrypted credential, register the journal mailbox, and queue
//! its first backfill.

use std::env;
use std::error::Error;
use std::io;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use mailroom_core::gmail::oauth::{
    GMAIL_READONLY_SCOPE, TOKEN_ENDPOINT, exchange_code_for_tokens,
};
use mailroom_core::{
    Config, CredentialRepository, Database, GmailClient, JobQueue, MailboxPurpose,
    MailboxRepository, NewMailbox, TokenCipher, enqueue_mailbox_backfill, init_telemetry,
    migrations,
};
use rand::RngCore;
use rand::rngs::OsRng;
use reqwest::Url;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time;

type AnyError = Box<dyn Error + Send + Sync>;

const CALLBACK_PATH: &str = "/oauth2callback";
const SUCCESS_HTML: &str = r#"<!doctype html>
<html>
  <head><title>Mailroom</title></head>
  <body style="font-family: sans-serif;">
    <h2>Mailbox connected</h2>
    <p>You can close this window and return to the terminal.</p>
  </body>
</html>
"#;

#[tokio::main]
async fn main() -> Result<(), AnyError> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;
    init_telemetry(&config.app)?;

    let organization_id = env::var("MAILROOM_ORG_ID")
        .map_err(|_| "MAILROOM_ORG_ID must name the organization to attach the mailbox to")?;

    let db = Database::open(&config.paths.database).await?;
    migrations::run_migrations(&db).await?;
    let cipher = Arc::new(TokenCipher::from_base64_key(
        &config.crypto.encryption_key_base64,
    )?);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let redirect_uri = format!("http://127.0.0.1:{port}{CALLBACK_PATH}");
    let state = random_state();

    let auth_url = mailroom_core::gmail::oauth::build_authorization_url(
        &config.google.client_id,
        &redirect_uri,
        &[GMAIL_READONLY_SCOPE],
        &state,
    )?;

    println!("Opening browser for Google consent...");
    if let Err(err) = maybe_open_browser(&auth_url) {
        eprintln!("Could not open browser automatically: {err}. Please open the URL manually.");
    }
    println!("If the browser did not open, paste this into a new tab:\n{auth_url}\n");
    println!("Listening on {redirect_uri} for the OAuth callback...\n");

    let code = match time::timeout(Duration::from_secs(300), wait_for_code(listener, state)).await
    {
        Ok(result) => result?,
        Err(_) => return Err("Timed out waiting for OAuth callback (5 minutes)".into()),
    };

    println!("Received authorization code, exchanging for tokens...");
    let http = reqwest::Client::new();
    let token = exchange_code_for_tokens(
        &http,
        TOKEN_ENDPOINT,
        &code,
        &config.google.client_id,
        &config.google.client_secret,
        &redirect_uri,
    )
    .await?;

    let profile = GmailClient::new(http.clone(), token.access_token.clone())
        .get_profile()
        .await?;
    println!("Connected Gmail account: {}", profile.email_address);

    let refresh_token = token
        .refresh_token
        .clone()
        .ok_or("token exchange returned no refresh token")?;

    let credentials = CredentialRepository::new(db.clone());
    let scopes = token.scopes();
    let credential = credentials
        .upsert(
            &organization_id,
            "google",
            &profile.email_address,
            &scopes,
            &refresh_token,
            &cipher,
        )
        .await?;

    let mailboxes = MailboxRepository::new(db.clone());
    let mailbox = mailboxes
        .create(NewMailbox {
            organization_id: organization_id.clone(),
            purpose: MailboxPurpose::Journal,
            email_address: profile.email_address.clone(),
            display_name: None,
            oauth_credential_id: credential.id,
        })
        .await?;

    let queue = JobQueue::new(db);
    enqueue_mailbox_backfill(&queue, &organization_id, &mailbox.id, "initial_connect").await?;

    println!(
        "Mailbox {} registered ({}). Initial backfill queued; start the worker to ingest.",
        mailbox.email_address, mailbox.id
    );
    Ok(())
}

fn random_state() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

async fn wait_for_code(listener: TcpListener, expected_state: String) -> Result<String, AnyError> {
    let (mut stream, _addr) = listener.accept().await?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    for _ in 0..16 {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 8192 {
            break;
        }
    }

    let request = String::from_utf8_lossy(&buf);
    let request_line = request.lines().next().ok_or("Malformed HTTP request")?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    if method != "GET" {
        send_response(&mut stream, 405, "Only GET is supported").await?;
        return Err("Unexpected HTTP method".into());
    }

    let url = Url::parse(&format!("http://localhost{path}"))?;
    let mut code: Option<String> = None;
    let mut state: Option<String> = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.to_string()),
            "state" => state = Some(value.to_string()),
            _ => {}
        }
    }

    let Some(code) = code.filter(|c| !c.is_empty()) else {
        send_response(&mut stream, 400, "Missing code in callback. Please retry.").await?;
        return Err("Missing code in callback".into());
    };

    if state.as_deref() != Some(expected_state.as_str()) {
        send_response(&mut stream, 400, "State mismatch, please retry.").await?;
        return Err("State mismatch".into());
    }

    send_response(&mut stream, 200, SUCCESS_HTML).await?;
    Ok(code)
}

async fn send_response(
    stream: &mut tokio::net::TcpStream,
    status: u16,
    body: &str,
) -> io::Result<()> {
    let status_line = match status {
        400 => "400 Bad Request",
        405 => "405 Method Not Allowed",
        _ => "200 OK",
    };
    let response = format!(
        "HTTP/1.1 {status_line}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await
}

fn maybe_open_browser(url: &str) -> Result<(), AnyError> {
    #[cfg(target_os = "macos")]
    let mut command = Command::new("open");
    #[cfg(target_os = "linux")]
    let mut command = Command::new("xdg-open");
    #[cfg(target_os = "windows")]
    let mut command = {
        let mut cmd = Command::new("cmd");
        let escaped_url = url.replace('"', "\"\"");
        cmd.arg("/C").arg(format!("start \"\" \"{}\"", escaped_url));
        cmd
    };

    #[cfg(not(target_os = "windows"))]
    command.arg(url);
    let status = command.status()?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("browser command exited with status {status}").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[test]
    fn random_state_is_urlsafe_and_correct_length() {
        let state = random_state();
        assert!(state.len() >= 43);
        let decoded = URL_SAFE_NO_PAD
            .decode(state.as_bytes())
            .expect("state decodes");
        assert_eq!(decoded.len(), 32);
    }

    #[tokio::test]
    async fn wait_for_code_returns_authorization_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let wait = tokio::spawn(wait_for_code(listener, "state".to_string()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request =
            format!("GET {CALLBACK_PATH}?code=abc&state=state HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();

        let code = wait.await.unwrap().expect("code returned");
        assert_eq!(code, "abc");
    }

    #[tokio::test]
    async fn wait_for_code_rejects_state_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let wait = tokio::spawn(wait_for_code(listener, "expected".to_string()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request =
            format!("GET {CALLBACK_PATH}?code=abc&state=wrong HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf).contains("400 Bad Request"));

        let err = wait.await.unwrap().expect_err("state mismatch");
        assert!(err.to_string().contains("State mismatch"));
    }
}
