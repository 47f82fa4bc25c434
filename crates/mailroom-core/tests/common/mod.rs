//! Shared fixture for the end-to-end suites: a migrated temp database, one
//! organization with a journal mailbox, a filesystem blob store, and a job
//! dispatcher wired for local use.
#![allow(dead_code)]

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use libsql::params;
use mailroom_core::{
    CredentialRepository, Database, DiscoveredOccurrence, FsBlobStore, GoogleConfig,
    JOB_TYPE_OCCURRENCE_FETCH_RAW, JobDispatcher, JobExecutor as _, JobQueue, MailboxPurpose,
    MailboxRepository, NewMailbox, OccurrenceRepository, TokenCipher, WorkerConfig,
    run_migrations, run_one_job,
};
use tempfile::TempDir;
use uuid::Uuid;

pub struct TestEnv {
    pub db: Database,
    pub org: String,
    pub mailbox_id: String,
    pub queue: JobQueue,
    pub dispatcher: JobDispatcher,
    pub worker_config: WorkerConfig,
    _db_dir: TempDir,
    _blob_dir: TempDir,
}

pub fn test_cipher() -> TokenCipher {
    let key = BASE64.encode([42u8; 32]);
    TokenCipher::from_base64_key(&key).expect("test cipher")
}

pub fn google_config() -> GoogleConfig {
    GoogleConfig {
        client_id: "test-client".into(),
        client_secret: "test-secret".into(),
        redirect_uri: "http://localhost:8000/oauth/callback".into(),
    }
}

pub async fn test_env() -> TestEnv {
    let db_dir = TempDir::new().expect("db dir");
    let blob_dir = TempDir::new().expect("blob dir");
    let db_path = db_dir.path().join(format!("db_{}.sqlite", Uuid::new_v4()));
    let db = Database::open(&db_path).await.expect("create db");
    run_migrations(&db).await.expect("migrations");

    let org = Uuid::new_v4().to_string();
    let conn = db.connection().await.expect("conn");
    conn.execute(
        "INSERT INTO organizations (id, name, created_at) VALUES (?1, 'Acme Support', '2026-01-01T00:00:00Z')",
        params![org.clone()],
    )
    .await
    .expect("seed org");

    let cipher = Arc::new(test_cipher());
    let credentials = CredentialRepository::new(db.clone());
    let credential = credentials
        .upsert(
            &org,
            "google",
            "journal@acme.test",
            &["https://www.googleapis.com/auth/gmail.readonly".to_string()],
            "refresh-token",
            &cipher,
        )
        .await
        .expect("seed credential");

    let mailboxes = MailboxRepository::new(db.clone());
    let mailbox = mailboxes
        .create(NewMailbox {
            organization_id: org.clone(),
            purpose: MailboxPurpose::Journal,
            email_address: "journal@acme.test".into(),
            display_name: Some("Journal".into()),
            oauth_credential_id: credential.id,
        })
        .await
        .expect("seed mailbox");

    let dispatcher = JobDispatcher::new(
        db.clone(),
        reqwest::Client::new(),
        cipher,
        Arc::new(FsBlobStore::new(blob_dir.path().join("blobs"))),
        google_config(),
    );

    TestEnv {
        queue: JobQueue::new(db.clone()),
        db,
        org,
        mailbox_id: mailbox.id,
        dispatcher,
        worker_config: WorkerConfig {
            poll_interval: std::time::Duration::from_millis(5),
            history_poll_interval: std::time::Duration::from_secs(30),
            worker_id: "itest-worker".into(),
        },
        _db_dir: db_dir,
        _blob_dir: blob_dir,
    }
}

impl TestEnv {
    /// Seed a discovered occurrence for raw bytes and queue its fetch, the
    /// way the sync orchestrator would.
    pub async fn ingest_raw(&self, provider_message_id: &str, raw: &[u8]) -> String {
        let occurrences = OccurrenceRepository::new(self.db.clone());
        let labels = vec!["INBOX".to_string()];
        let occurrence_id = occurrences
            .upsert_discovered(DiscoveredOccurrence {
                organization_id: &self.org,
                mailbox_id: &self.mailbox_id,
                provider_message_id,
                provider_thread_id: None,
                provider_history_id: None,
                internal_date: None,
                label_ids: &labels,
            })
            .await
            .expect("upsert occurrence");

        self.queue
            .enqueue(
                JOB_TYPE_OCCURRENCE_FETCH_RAW,
                Some(&self.org),
                Some(&self.mailbox_id),
                serde_json::json!({
                    "occurrence_id": occurrence_id,
                    "raw_eml_base64": BASE64.encode(raw),
                }),
                Some(format!("occurrence_fetch_raw:{occurrence_id}")),
                None,
            )
            .await
            .expect("enqueue fetch_raw");

        occurrence_id
    }

    /// Run jobs until the queue drains; returns how many jobs ran.
    pub async fn drain_queue(&self) -> usize {
        let mut ran = 0;
        loop {
            let claimed = run_one_job(
                &self.db,
                &self.queue,
                &self.dispatcher,
                &self.worker_config,
            )
            .await
            .expect("run job");
            if !claimed {
                break;
            }
            ran += 1;
            assert!(ran < 200, "queue did not drain; runaway job loop");
        }
        ran
    }

    pub async fn execute_job(&self, job_id: &str) -> Result<(), mailroom_core::JobError> {
        let job = self.queue.fetch_job(job_id).await.expect("fetch job");
        self.dispatcher.execute(job).await
    }

    pub async fn count(&self, sql: &str) -> i64 {
        let conn = self.db.connection().await.expect("conn");
        let mut rows = conn.query(sql, ()).await.expect("query");
        rows.next()
            .await
            .expect("row")
            .expect("present")
            .get(0)
            .expect("count")
    }
}
