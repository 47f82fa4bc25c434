//! Mailbox sync flows against a mocked provider: backfill idempotence,
//! history polling, expired-history recovery, and pause semantics.

mod common;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration, Utc};
use common::test_env;
use libsql::params;
use mailroom_core::{
    JOB_TYPE_MAILBOX_BACKFILL, JOB_TYPE_MAILBOX_HISTORY_SYNC, JobStatus, MailboxRepository,
};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn raw_email(message_id: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!(
        "Message-ID: <{message_id}>\r\n\
         Date: Mon, 6 Jul 2026 10:30:00 +0000\r\n\
         Subject: Hello\r\n\
         From: ann@customer.test\r\n\
         To: support@acme.test\r\n\
         \r\n\
         Body for {message_id}.\r\n"
    ))
}

async fn mount_token_endpoint(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "test-access-token",
            "expires_in": 3600
        })))
        .mount(server)
        .await;
}

async fn mount_raw_message(server: &MockServer, gmail_id: &str, history_id: &str, rfc_id: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/gmail/v1/users/me/messages/{gmail_id}")))
        .and(query_param("format", "raw"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": gmail_id,
            "threadId": format!("thr-{gmail_id}"),
            "historyId": history_id,
            "internalDate": "1751793000000",
            "labelIds": ["INBOX"],
            "raw": raw_email(rfc_id)
        })))
        .mount(server)
        .await;
}

async fn enqueue_backfill_job(env: &common::TestEnv) -> String {
    env.queue
        .enqueue(
            JOB_TYPE_MAILBOX_BACKFILL,
            Some(&env.org),
            Some(&env.mailbox_id),
            json!({
                "organization_id": env.org,
                "mailbox_id": env.mailbox_id,
                "reason": "test",
            }),
            Some(format!("mailbox_backfill:{}", env.mailbox_id)),
            None,
        )
        .await
        .expect("enqueue")
        .expect("id")
}

async fn enqueue_history_job(env: &common::TestEnv) -> String {
    env.queue
        .enqueue(
            JOB_TYPE_MAILBOX_HISTORY_SYNC,
            Some(&env.org),
            Some(&env.mailbox_id),
            json!({
                "organization_id": env.org,
                "mailbox_id": env.mailbox_id,
                "reason": "test",
            }),
            Some(format!("mailbox_history_sync:{}", env.mailbox_id)),
            None,
        )
        .await
        .expect("enqueue")
        .expect("id")
}

#[tokio::test]
async fn backfill_discovers_messages_and_schedules_history_polling() {
    let mut env = test_env().await;
    let server = MockServer::start().await;
    mount_token_endpoint(&server).await;

    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages"))
        .and(query_param("includeSpamTrash", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [
                { "id": "gm-1", "threadId": "thr-1" },
                { "id": "gm-2", "threadId": "thr-2" }
            ]
        })))
        .mount(&server)
        .await;
    mount_raw_message(&server, "gm-1", "101", "1@x").await;
    mount_raw_message(&server, "gm-2", "102", "2@x").await;

    env.dispatcher = env
        .dispatcher
        .clone()
        .with_gmail_api_base(format!("{}/gmail/v1/users/me", server.uri()))
        .with_token_endpoint(format!("{}/token", server.uri()));

    let job_id = enqueue_backfill_job(&env).await;
    env.execute_job(&job_id).await.expect("backfill succeeds");
    env.queue.mark_succeeded(&job_id).await.expect("finish");

    assert_eq!(
        env.count("SELECT COUNT(*) FROM message_occurrences").await,
        2
    );
    assert_eq!(
        env.count("SELECT COUNT(*) FROM bg_jobs WHERE type = 'occurrence_fetch_raw'")
            .await,
        2
    );
    assert_eq!(
        env.count("SELECT COUNT(*) FROM bg_jobs WHERE type = 'mailbox_history_sync'")
            .await,
        1
    );

    let mailbox = MailboxRepository::new(env.db.clone())
        .get(&env.org, &env.mailbox_id)
        .await
        .expect("mailbox");
    assert_eq!(mailbox.gmail_history_id, Some(102));
    assert!(mailbox.last_full_sync_at.is_some());
    assert!(mailbox.last_sync_error.is_none());
}

#[tokio::test]
async fn rerunning_backfill_is_idempotent() {
    let mut env = test_env().await;
    let server = MockServer::start().await;
    mount_token_endpoint(&server).await;

    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [
                { "id": "gm-1", "threadId": "thr-1" },
                { "id": "gm-2", "threadId": "thr-2" }
            ]
        })))
        .mount(&server)
        .await;
    mount_raw_message(&server, "gm-1", "101", "1@x").await;
    mount_raw_message(&server, "gm-2", "102", "2@x").await;

    env.dispatcher = env
        .dispatcher
        .clone()
        .with_gmail_api_base(format!("{}/gmail/v1/users/me", server.uri()))
        .with_token_endpoint(format!("{}/token", server.uri()));

    let first = enqueue_backfill_job(&env).await;
    env.execute_job(&first).await.expect("first backfill");
    env.queue.mark_succeeded(&first).await.expect("finish");

    let mailbox_repo = MailboxRepository::new(env.db.clone());
    let after_first = mailbox_repo
        .get(&env.org, &env.mailbox_id)
        .await
        .expect("mailbox");

    let second = enqueue_backfill_job(&env).await;
    env.execute_job(&second).await.expect("second backfill");
    env.queue.mark_succeeded(&second).await.expect("finish");

    assert_eq!(
        env.count("SELECT COUNT(*) FROM message_occurrences").await,
        2,
        "same provider state produces the same occurrence set"
    );
    assert_eq!(
        env.count("SELECT COUNT(*) FROM bg_jobs WHERE type = 'occurrence_fetch_raw'")
            .await,
        2,
        "exactly one fetch_raw job per provider message"
    );

    let after_second = mailbox_repo
        .get(&env.org, &env.mailbox_id)
        .await
        .expect("mailbox");
    assert_eq!(after_second.gmail_history_id, Some(102));
    assert!(
        after_second.last_full_sync_at.expect("second stamp")
            >= after_first.last_full_sync_at.expect("first stamp")
    );
}

#[tokio::test]
async fn history_sync_ingests_added_messages() {
    let mut env = test_env().await;
    let server = MockServer::start().await;
    mount_token_endpoint(&server).await;

    let conn = env.db.connection().await.expect("conn");
    conn.execute(
        "UPDATE mailboxes SET gmail_history_id = 100 WHERE id = ?1",
        params![env.mailbox_id.as_str()],
    )
    .await
    .expect("seed watermark");

    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/history"))
        .and(query_param("startHistoryId", "100"))
        .and(query_param("historyTypes", "messageAdded"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "history": [
                {
                    "id": "110",
                    "messagesAdded": [
                        { "message": { "id": "gm-9", "threadId": "thr-9" } },
                        { "message": { "id": "gm-9", "threadId": "thr-9" } }
                    ]
                }
            ],
            "historyId": "120"
        })))
        .mount(&server)
        .await;
    mount_raw_message(&server, "gm-9", "110", "9@x").await;

    env.dispatcher = env
        .dispatcher
        .clone()
        .with_gmail_api_base(format!("{}/gmail/v1/users/me", server.uri()))
        .with_token_endpoint(format!("{}/token", server.uri()));

    let job_id = enqueue_history_job(&env).await;
    env.execute_job(&job_id).await.expect("history sync");
    env.queue.mark_succeeded(&job_id).await.expect("finish");

    assert_eq!(
        env.count("SELECT COUNT(*) FROM message_occurrences").await,
        1,
        "duplicate history records collapse to one occurrence"
    );
    assert_eq!(
        env.count("SELECT COUNT(*) FROM bg_jobs WHERE type = 'occurrence_fetch_raw'")
            .await,
        1
    );

    let mailbox = MailboxRepository::new(env.db.clone())
        .get(&env.org, &env.mailbox_id)
        .await
        .expect("mailbox");
    assert_eq!(mailbox.gmail_history_id, Some(120));
    assert!(mailbox.last_incremental_sync_at.is_some());
}

#[tokio::test]
async fn expired_history_recovers_by_queueing_backfill() {
    let mut env = test_env().await;
    let server = MockServer::start().await;
    mount_token_endpoint(&server).await;

    let conn = env.db.connection().await.expect("conn");
    conn.execute(
        "UPDATE mailboxes SET gmail_history_id = 100 WHERE id = ?1",
        params![env.mailbox_id.as_str()],
    )
    .await
    .expect("seed watermark");

    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/history"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    env.dispatcher = env
        .dispatcher
        .clone()
        .with_gmail_api_base(format!("{}/gmail/v1/users/me", server.uri()))
        .with_token_endpoint(format!("{}/token", server.uri()));

    let job_id = enqueue_history_job(&env).await;
    env.execute_job(&job_id)
        .await
        .expect("expired history is a recovery, not a failure");
    env.queue.mark_succeeded(&job_id).await.expect("finish");

    let job = env.queue.fetch_job(&job_id).await.expect("fetch");
    assert_eq!(job.status, JobStatus::Succeeded);

    let conn = env.db.connection().await.expect("conn");
    let mut rows = conn
        .query(
            "SELECT dedupe_key FROM bg_jobs WHERE type = ?1",
            params![JOB_TYPE_MAILBOX_BACKFILL],
        )
        .await
        .expect("query");
    let row = rows.next().await.expect("row").expect("backfill job");
    let dedupe: String = row.get(0).expect("dedupe");
    assert_eq!(dedupe, format!("mailbox_backfill:{}", env.mailbox_id));
    assert!(rows.next().await.expect("end").is_none(), "exactly one backfill");

    let mailbox = MailboxRepository::new(env.db.clone())
        .get(&env.org, &env.mailbox_id)
        .await
        .expect("mailbox");
    assert!(
        mailbox
            .last_sync_error
            .expect("error recorded")
            .to_lowercase()
            .contains("history")
    );
}

#[tokio::test]
async fn paused_mailbox_skips_sync_without_touching_the_provider() {
    let mut env = test_env().await;
    let server = MockServer::start().await;

    // Zero expected requests: a paused mailbox never reaches the provider.
    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let mailboxes = MailboxRepository::new(env.db.clone());
    mailboxes
        .pause_ingestion(
            &env.org,
            &env.mailbox_id,
            Utc::now() + Duration::minutes(15),
            "Auto-paused by sync circuit breaker after 5 failed mailbox_history_sync attempts",
        )
        .await
        .expect("pause");

    env.dispatcher = env
        .dispatcher
        .clone()
        .with_gmail_api_base(format!("{}/gmail/v1/users/me", server.uri()))
        .with_token_endpoint(format!("{}/token", server.uri()));

    let job_id = enqueue_backfill_job(&env).await;
    env.execute_job(&job_id)
        .await
        .expect("paused mailbox is a silent skip");

    assert_eq!(
        env.count("SELECT COUNT(*) FROM message_occurrences").await,
        0
    );
}

#[tokio::test]
async fn backfill_error_records_last_sync_error_and_retries() {
    let mut env = test_env().await;
    let server = MockServer::start().await;
    mount_token_endpoint(&server).await;

    Mock::given(method("GET"))
        .and(path("/gmail/v1/users/me/messages"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    env.dispatcher = env
        .dispatcher
        .clone()
        .with_gmail_api_base(format!("{}/gmail/v1/users/me", server.uri()))
        .with_token_endpoint(format!("{}/token", server.uri()));

    let job_id = enqueue_backfill_job(&env).await;
    let err = env
        .execute_job(&job_id)
        .await
        .expect_err("provider failure is retryable");
    assert!(err.is_retryable());

    let mailbox = MailboxRepository::new(env.db.clone())
        .get(&env.org, &env.mailbox_id)
        .await
        .expect("mailbox");
    assert_eq!(
        mailbox.last_sync_error.as_deref(),
        Some("Gmail backfill failed (503)")
    );
}
