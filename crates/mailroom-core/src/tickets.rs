use chrono::{DateTime, Utc};
use data_encoding::BASE32_NOPAD;
use libsql::{Row, params};
use rand::Rng;
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_timestamp, to_rfc3339};
use crate::ingest::fingerprint::{compute_fingerprint_v1, compute_signature_v1};
use crate::ingest::parser::{ParsedEmail, normalize_subject};
use crate::messages::{CanonicalIdentity, MessageDirection, MessageError, MessageRepository};
use crate::queue::{JobQueue, QueueError};

const TICKET_COLUMNS: &str = "id, organization_id, ticket_code, status, priority, subject, subject_norm, requester_email, requester_name, assignee_user_id, assignee_queue_id, first_message_at, last_message_at, last_activity_at, closed_at, stitch_reason, stitch_confidence";

/// Opaque ticket slug used in reply-to tokens: `tkt-` plus 10 random bytes
/// in unpadded lowercase base32.
pub fn new_ticket_code() -> String {
    let mut raw = [0u8; 10];
    rand::thread_rng().fill(&mut raw[..]);
    format!("tkt-{}", BASE32_NOPAD.encode(&raw).to_lowercase())
}

#[derive(Debug, Clone)]
pub struct Ticket {
    pub id: String,
    pub organization_id: String,
    pub ticket_code: String,
    pub status: String,
    pub priority: String,
    pub subject: Option<String>,
    pub subject_norm: Option<String>,
    pub requester_email: Option<String>,
    pub requester_name: Option<String>,
    pub assignee_user_id: Option<String>,
    pub assignee_queue_id: Option<String>,
    pub first_message_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub stitch_reason: Option<String>,
    pub stitch_confidence: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewTicket {
    pub subject: Option<String>,
    pub subject_norm: Option<String>,
    pub requester_email: Option<String>,
    pub requester_name: Option<String>,
    pub first_message_at: Option<DateTime<Utc>>,
    pub stitch_reason: String,
    pub stitch_confidence: String,
}

/// Assignment-relevant ticket fields, recorded before/after routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketSnapshot {
    pub status: String,
    pub assignee_user_id: Option<String>,
    pub assignee_queue_id: Option<String>,
}

impl TicketSnapshot {
    pub fn to_json(&self) -> Value {
        json!({
            "status": self.status,
            "assignee_user_id": self.assignee_user_id,
            "assignee_queue_id": self.assignee_queue_id,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OutboundReply {
    pub send_identity_id: Option<String>,
    pub to_emails: Vec<String>,
    pub cc_emails: Vec<String>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub message_id: String,
    pub oss_message_id: Uuid,
}

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ticket not found: {0}")]
    NotFound(String),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Clone)]
pub struct TicketRepository {
    db: Database,
}

impl TicketRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        organization_id: &str,
        new: NewTicket,
    ) -> Result<Ticket, TicketError> {
        let id = Uuid::new_v4().to_string();
        self.insert_with_id(organization_id, &id, new).await
    }

    async fn insert_with_id(
        &self,
        organization_id: &str,
        id: &str,
        new: NewTicket,
    ) -> Result<Ticket, TicketError> {
        let now = now_rfc3339();
        let first_message_at = new.first_message_at.map(to_rfc3339);
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO tickets (id, organization_id, ticket_code, status, priority, subject, subject_norm, requester_email, requester_name, created_at, updated_at, first_message_at, last_message_at, last_activity_at, stitch_reason, stitch_confidence)
                     VALUES (?1, ?2, ?3, 'new', 'normal', ?4, ?5, ?6, ?7, ?8, ?8, ?9, ?9, ?9, ?10, ?11)
                     RETURNING {TICKET_COLUMNS}"
                ),
                params![
                    id,
                    organization_id,
                    new_ticket_code(),
                    new.subject,
                    new.subject_norm,
                    new.requester_email,
                    new.requester_name,
                    now,
                    first_message_at,
                    new.stitch_reason,
                    new.stitch_confidence
                ],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_to_ticket(row),
            None => Err(TicketError::NotFound(id.to_string())),
        }
    }

    /// Tickets referenced by an X-OSS-Ticket-ID header are created with the
    /// caller-chosen id if they do not exist yet.
    pub async fn get_or_create_with_id(
        &self,
        organization_id: &str,
        ticket_id: &str,
        new: NewTicket,
    ) -> Result<String, TicketError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT id FROM tickets WHERE organization_id = ?1 AND id = ?2",
                params![organization_id, ticket_id],
            )
            .await?;
        if rows.next().await?.is_some() {
            return Ok(ticket_id.to_string());
        }

        self.insert_with_id(organization_id, ticket_id, new).await?;
        Ok(ticket_id.to_string())
    }

    pub async fn get(&self, organization_id: &str, id: &str) -> Result<Ticket, TicketError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TICKET_COLUMNS} FROM tickets WHERE organization_id = ?1 AND id = ?2"
                ),
                params![organization_id, id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_to_ticket(row),
            None => Err(TicketError::NotFound(id.to_string())),
        }
    }

    pub async fn find_by_code(
        &self,
        organization_id: &str,
        ticket_code: &str,
    ) -> Result<Option<String>, TicketError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT id FROM tickets WHERE organization_id = ?1 AND ticket_code = ?2",
                params![organization_id, ticket_code],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// The ticket a canonical message is already linked to, if any.
    pub async fn find_ticket_for_message(
        &self,
        organization_id: &str,
        message_id: &str,
    ) -> Result<Option<String>, TicketError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT ticket_id FROM ticket_messages
                 WHERE organization_id = ?1 AND message_id = ?2",
                params![organization_id, message_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Link a canonical message to a ticket. A message links to at most one
    /// ticket per organization; replays are ignored.
    pub async fn link_message(
        &self,
        organization_id: &str,
        ticket_id: &str,
        message_id: &str,
        stitch_reason: &str,
        stitch_confidence: &str,
    ) -> Result<(), TicketError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "INSERT OR IGNORE INTO ticket_messages (id, organization_id, ticket_id, message_id, stitched_at, stitch_reason, stitch_confidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                organization_id,
                ticket_id,
                message_id,
                now_rfc3339(),
                stitch_reason,
                stitch_confidence
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn insert_event(
        &self,
        organization_id: &str,
        ticket_id: &str,
        event_type: &str,
        event_data: &Value,
    ) -> Result<(), TicketError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "INSERT INTO ticket_events (id, organization_id, ticket_id, actor_user_id, event_type, created_at, event_data)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                organization_id,
                ticket_id,
                event_type,
                now_rfc3339(),
                serde_json::to_string(event_data)?
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn count_events(
        &self,
        organization_id: &str,
        ticket_id: &str,
        event_type: &str,
    ) -> Result<i64, TicketError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM ticket_events
                 WHERE organization_id = ?1 AND ticket_id = ?2 AND event_type = ?3",
                params![organization_id, ticket_id, event_type],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    /// Replay guard for the outbound-send transition: has this message's
    /// send already been recorded on the ticket?
    pub async fn has_outbound_sent_event(
        &self,
        organization_id: &str,
        ticket_id: &str,
        message_id: &str,
    ) -> Result<bool, TicketError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT id FROM ticket_events
                 WHERE organization_id = ?1 AND ticket_id = ?2 AND event_type = 'outbound_sent'
                   AND json_extract(event_data, '$.message_id') = ?3
                 LIMIT 1",
                params![organization_id, ticket_id, message_id],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Sender and direction of the most recently parsed message on the
    /// ticket, used as rule-match input.
    pub async fn latest_sender(
        &self,
        organization_id: &str,
        ticket_id: &str,
    ) -> Result<Option<(Option<String>, String)>, TicketError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT mc.from_email, m.direction
                 FROM ticket_messages tm
                 JOIN messages m ON m.id = tm.message_id
                 JOIN message_contents mc
                   ON mc.message_id = m.id AND mc.organization_id = tm.organization_id
                 WHERE tm.organization_id = ?1 AND tm.ticket_id = ?2
                 ORDER BY mc.parsed_at DESC
                 LIMIT 1",
                params![organization_id, ticket_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some((row.get(0)?, row.get(1)?))),
            None => Ok(None),
        }
    }

    pub async fn mark_spam(
        &self,
        organization_id: &str,
        ticket_id: &str,
    ) -> Result<(), TicketError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        conn.execute(
            "UPDATE tickets
             SET status = 'spam', closed_at = ?3, updated_at = ?3, last_activity_at = ?3
             WHERE organization_id = ?1 AND id = ?2",
            params![organization_id, ticket_id, now],
        )
        .await?;
        Ok(())
    }

    pub async fn snapshot(
        &self,
        organization_id: &str,
        ticket_id: &str,
    ) -> Result<TicketSnapshot, TicketError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT status, assignee_user_id, assignee_queue_id FROM tickets
                 WHERE organization_id = ?1 AND id = ?2",
                params![organization_id, ticket_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(TicketSnapshot {
                status: row.get(0)?,
                assignee_user_id: row.get(1)?,
                assignee_queue_id: row.get(2)?,
            }),
            None => Err(TicketError::NotFound(ticket_id.to_string())),
        }
    }

    /// Create the canonical outbound message for an agent reply, link it to
    /// the ticket, and queue the durable send transition. The fresh
    /// `oss_message_id` is what later deduplicates the provider's sent-mail
    /// mirror back onto this row.
    pub async fn create_outbound_reply(
        &self,
        organization_id: &str,
        ticket_id: &str,
        reply: OutboundReply,
    ) -> Result<OutboundMessage, TicketError> {
        // Fails when the ticket is missing.
        let _ticket = self.get(organization_id, ticket_id).await?;

        let oss_message_id = Uuid::new_v4();
        let now = Utc::now();

        let parsed = ParsedEmail {
            date: Some(now),
            subject: reply.subject.clone(),
            subject_norm: normalize_subject(reply.subject.as_deref()),
            to_emails: reply
                .to_emails
                .iter()
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            cc_emails: reply
                .cc_emails
                .iter()
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            body_text: reply.body_text.clone(),
            ..ParsedEmail::default()
        };
        let fingerprint = compute_fingerprint_v1(&parsed, &[]);
        let signature = compute_signature_v1(&parsed, &[]);

        let message_repo = MessageRepository::new(self.db.clone());
        let message_id = message_repo
            .upsert_canonical(CanonicalIdentity {
                organization_id,
                direction: MessageDirection::Outbound,
                oss_message_id: Some(oss_message_id),
                rfc_message_id: None,
                fingerprint_v1: &fingerprint,
                signature_v1: &signature,
            })
            .await?;
        message_repo
            .insert_content(organization_id, &message_id, &parsed)
            .await?;

        self.link_message(organization_id, ticket_id, &message_id, "outbound_reply", "high")
            .await?;

        let now_text = to_rfc3339(now);
        let conn = self.db.connection().await?;
        conn.execute(
            "UPDATE tickets
             SET last_message_at = ?3, last_activity_at = ?3, updated_at = ?3
             WHERE organization_id = ?1 AND id = ?2",
            params![organization_id, ticket_id, now_text],
        )
        .await?;

        let queue = JobQueue::new(self.db.clone());
        queue
            .enqueue(
                crate::jobs::JOB_TYPE_OUTBOUND_SEND,
                Some(organization_id),
                None,
                json!({
                    "organization_id": organization_id,
                    "ticket_id": ticket_id,
                    "message_id": message_id,
                    "send_identity_id": reply.send_identity_id,
                    "to_emails": reply.to_emails,
                    "cc_emails": reply.cc_emails,
                    "subject": reply.subject,
                    "body_text": reply.body_text,
                }),
                Some(format!("outbound_send:{message_id}")),
                None,
            )
            .await?;

        Ok(OutboundMessage {
            message_id,
            oss_message_id,
        })
    }
}

fn row_to_ticket(row: Row) -> Result<Ticket, TicketError> {
    Ok(Ticket {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        ticket_code: row.get(2)?,
        status: row.get(3)?,
        priority: row.get(4)?,
        subject: row.get(5)?,
        subject_norm: row.get(6)?,
        requester_email: row.get(7)?,
        requester_name: row.get(8)?,
        assignee_user_id: row.get(9)?,
        assignee_queue_id: row.get(10)?,
        first_message_at: parse_timestamp(row.get(11)?),
        last_message_at: parse_timestamp(row.get(12)?),
        last_activity_at: parse_timestamp(row.get(13)?),
        closed_at: parse_timestamp(row.get(14)?),
        stitch_reason: row.get(15)?,
        stitch_confidence: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_org, setup_db};

    fn new_ticket(subject: &str) -> NewTicket {
        NewTicket {
            subject: Some(subject.to_string()),
            subject_norm: Some(subject.to_string()),
            requester_email: Some("a@x.test".into()),
            requester_name: None,
            first_message_at: Some(Utc::now()),
            stitch_reason: "new_message".into(),
            stitch_confidence: "low".into(),
        }
    }

    #[test]
    fn ticket_codes_are_lowercase_base32_slugs() {
        let code = new_ticket_code();
        assert!(code.starts_with("tkt-"));
        let token = &code[4..];
        assert_eq!(token.len(), 16);
        assert!(token.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert!(!token.contains('='));
        assert_ne!(new_ticket_code(), code);
    }

    #[tokio::test]
    async fn create_sets_defaults_and_timestamps() {
        let (db, _dir) = setup_db().await;
        let org = seed_org(&db).await;
        let repo = TicketRepository::new(db);

        let ticket = repo.create(&org, new_ticket("Hello")).await.expect("create");
        assert_eq!(ticket.status, "new");
        assert_eq!(ticket.priority, "normal");
        assert_eq!(ticket.stitch_reason.as_deref(), Some("new_message"));
        assert_eq!(ticket.stitch_confidence, "low");
        assert_eq!(ticket.first_message_at, ticket.last_message_at);
        assert_eq!(ticket.first_message_at, ticket.last_activity_at);

        let found = repo
            .find_by_code(&org, &ticket.ticket_code)
            .await
            .expect("lookup");
        assert_eq!(found.as_deref(), Some(ticket.id.as_str()));
    }

    #[tokio::test]
    async fn get_or_create_with_id_is_idempotent() {
        let (db, _dir) = setup_db().await;
        let org = seed_org(&db).await;
        let repo = TicketRepository::new(db);

        let wanted = Uuid::new_v4().to_string();
        let first = repo
            .get_or_create_with_id(&org, &wanted, new_ticket("From header"))
            .await
            .expect("create");
        assert_eq!(first, wanted);

        let second = repo
            .get_or_create_with_id(&org, &wanted, new_ticket("Ignored"))
            .await
            .expect("reuse");
        assert_eq!(second, wanted);

        let ticket = repo.get(&org, &wanted).await.expect("get");
        assert_eq!(ticket.subject.as_deref(), Some("From header"));
    }

    #[tokio::test]
    async fn message_links_are_unique_per_message() {
        let (db, _dir) = setup_db().await;
        let org = seed_org(&db).await;
        let repo = TicketRepository::new(db.clone());

        let ticket_a = repo.create(&org, new_ticket("A")).await.expect("a");
        let ticket_b = repo.create(&org, new_ticket("B")).await.expect("b");

        let conn = db.connection().await.expect("conn");
        conn.execute(
            "INSERT INTO messages (id, organization_id, direction, fingerprint_v1, signature_v1, created_at, first_seen_at)
             VALUES ('m1', ?1, 'inbound', x'00', x'00', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            params![org.as_str()],
        )
        .await
        .expect("seed message");

        repo.link_message(&org, &ticket_a.id, "m1", "new_ticket", "low")
            .await
            .expect("first link");
        repo.link_message(&org, &ticket_b.id, "m1", "threading", "medium")
            .await
            .expect("second link ignored");

        let linked = repo
            .find_ticket_for_message(&org, "m1")
            .await
            .expect("find");
        assert_eq!(linked.as_deref(), Some(ticket_a.id.as_str()));
    }

    #[tokio::test]
    async fn spam_marking_closes_the_ticket() {
        let (db, _dir) = setup_db().await;
        let org = seed_org(&db).await;
        let repo = TicketRepository::new(db);

        let ticket = repo.create(&org, new_ticket("Spam")).await.expect("create");
        repo.mark_spam(&org, &ticket.id).await.expect("mark spam");

        let ticket = repo.get(&org, &ticket.id).await.expect("get");
        assert_eq!(ticket.status, "spam");
        assert!(ticket.closed_at.is_some());
    }

    #[tokio::test]
    async fn outbound_sent_replay_guard_matches_by_message_id() {
        let (db, _dir) = setup_db().await;
        let org = seed_org(&db).await;
        let repo = TicketRepository::new(db);

        let ticket = repo.create(&org, new_ticket("Out")).await.expect("create");
        assert!(
            !repo
                .has_outbound_sent_event(&org, &ticket.id, "m-out")
                .await
                .expect("check")
        );

        repo.insert_event(
            &org,
            &ticket.id,
            "outbound_sent",
            &json!({"message_id": "m-out", "to_emails": ["c@x.test"]}),
        )
        .await
        .expect("insert event");

        assert!(
            repo.has_outbound_sent_event(&org, &ticket.id, "m-out")
                .await
                .expect("check")
        );
        assert!(
            !repo
                .has_outbound_sent_event(&org, &ticket.id, "m-other")
                .await
                .expect("check")
        );
    }

    #[tokio::test]
    async fn outbound_reply_creates_canonical_message_and_job() {
        let (db, _dir) = setup_db().await;
        let org = seed_org(&db).await;
        let repo = TicketRepository::new(db.clone());

        let ticket = repo.create(&org, new_ticket("Re: Hello")).await.expect("create");
        let outbound = repo
            .create_outbound_reply(
                &org,
                &ticket.id,
                OutboundReply {
                    send_identity_id: None,
                    to_emails: vec!["Customer@X.test".into()],
                    cc_emails: vec![],
                    subject: Some("Re: Hello".into()),
                    body_text: Some("On it.".into()),
                },
            )
            .await
            .expect("reply");

        let message_repo = MessageRepository::new(db.clone());
        let message = message_repo
            .get(&org, &outbound.message_id)
            .await
            .expect("message");
        assert_eq!(message.direction, "outbound");
        assert_eq!(
            message.oss_message_id.as_deref(),
            Some(outbound.oss_message_id.to_string().as_str())
        );

        let linked = repo
            .find_ticket_for_message(&org, &outbound.message_id)
            .await
            .expect("linked");
        assert_eq!(linked.as_deref(), Some(ticket.id.as_str()));

        let conn = db.connection().await.expect("conn");
        let mut rows = conn
            .query(
                "SELECT type, dedupe_key, payload FROM bg_jobs WHERE organization_id = ?1",
                params![org.as_str()],
            )
            .await
            .expect("jobs");
        let row = rows.next().await.expect("row").expect("job present");
        let job_type: String = row.get(0).expect("type");
        assert_eq!(job_type, "outbound_send");
        let dedupe: String = row.get(1).expect("dedupe");
        assert_eq!(dedupe, format!("outbound_send:{}", outbound.message_id));
        let payload: String = row.get(2).expect("payload");
        assert!(payload.contains(&outbound.message_id));
    }
}
