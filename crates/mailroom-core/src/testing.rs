//! Shared fixtures for module tests: a migrated temp database plus minimal
//! organization/user/queue/credential/mailbox rows.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use libsql::params;
use tempfile::TempDir;
use uuid::Uuid;

use crate::crypto::TokenCipher;
use crate::db::Database;
use crate::migrations::run_migrations;

pub(crate) async fn setup_db() -> (Database, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let db_name = format!("db_{}.sqlite", Uuid::new_v4());
    let db_path = dir.path().join(db_name);
    let db = Database::open(db_path.as_path()).await.expect("create db");
    run_migrations(&db).await.expect("migrations");
    (db, dir)
}

pub(crate) fn test_cipher() -> TokenCipher {
    let key = BASE64.encode([42u8; 32]);
    TokenCipher::from_base64_key(&key).expect("test cipher")
}

pub(crate) async fn seed_org(db: &Database) -> String {
    let id = Uuid::new_v4().to_string();
    let conn = db.connection().await.expect("conn");
    conn.execute(
        "INSERT INTO organizations (id, name, created_at) VALUES (?1, 'Acme Support', ?2)",
        params![id.clone(), crate::db::now_rfc3339()],
    )
    .await
    .expect("seed org");
    id
}

pub(crate) async fn seed_user(db: &Database, organization_id: &str, email: &str) -> String {
    let id = Uuid::new_v4().to_string();
    let conn = db.connection().await.expect("conn");
    conn.execute(
        "INSERT INTO users (id, organization_id, email, display_name, created_at)
         VALUES (?1, ?2, ?3, NULL, ?4)",
        params![id.clone(), organization_id, email, crate::db::now_rfc3339()],
    )
    .await
    .expect("seed user");
    id
}

pub(crate) async fn seed_queue_row(db: &Database, organization_id: &str, name: &str) -> String {
    let id = Uuid::new_v4().to_string();
    let conn = db.connection().await.expect("conn");
    conn.execute(
        "INSERT INTO queues (id, organization_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id.clone(), organization_id, name, crate::db::now_rfc3339()],
    )
    .await
    .expect("seed queue");
    id
}

pub(crate) async fn seed_credential(db: &Database, organization_id: &str, subject: &str) -> String {
    let cipher = test_cipher();
    let aad = crate::credentials::credential_aad(organization_id, "google", subject);
    let sealed = cipher.seal(b"refresh-token", &aad).expect("seal");

    let id = Uuid::new_v4().to_string();
    let conn = db.connection().await.expect("conn");
    conn.execute(
        "INSERT INTO oauth_credentials (id, organization_id, provider, subject, scopes, encrypted_refresh_token, created_at, updated_at)
         VALUES (?1, ?2, 'google', ?3, '[\"https://www.googleapis.com/auth/gmail.readonly\"]', ?4, ?5, ?5)",
        params![
            id.clone(),
            organization_id,
            subject,
            sealed,
            crate::db::now_rfc3339()
        ],
    )
    .await
    .expect("seed credential");
    id
}

pub(crate) async fn seed_mailbox(db: &Database, organization_id: &str, email: &str) -> String {
    let credential_id = seed_credential(db, organization_id, email).await;
    let id = Uuid::new_v4().to_string();
    let conn = db.connection().await.expect("conn");
    conn.execute(
        "INSERT INTO mailboxes (id, organization_id, purpose, provider, email_address, oauth_credential_id, is_enabled, created_at, updated_at)
         VALUES (?1, ?2, 'journal', 'gmail', ?3, ?4, 1, ?5, ?5)",
        params![
            id.clone(),
            organization_id,
            email,
            credential_id,
            crate::db::now_rfc3339()
        ],
    )
    .await
    .expect("seed mailbox");
    id
}
