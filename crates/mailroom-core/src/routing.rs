use glob::Pattern;
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339};
use crate::tickets::{TicketError, TicketRepository, TicketSnapshot};

const RULE_COLUMNS: &str = "id, organization_id, name, is_enabled, priority, match_recipient_pattern, match_sender_domain_pattern, match_sender_email_pattern, match_direction, action_assign_queue_id, action_assign_user_id, action_set_status, action_drop, action_auto_close";

#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub is_enabled: bool,
    pub priority: i64,
    pub match_recipient_pattern: Option<String>,
    pub match_sender_domain_pattern: Option<String>,
    pub match_sender_email_pattern: Option<String>,
    pub match_direction: Option<String>,
    pub action_assign_queue_id: Option<String>,
    pub action_assign_user_id: Option<String>,
    pub action_set_status: Option<String>,
    pub action_drop: bool,
    pub action_auto_close: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NewRoutingRule {
    pub name: String,
    pub priority: i64,
    pub match_recipient_pattern: Option<String>,
    pub match_sender_domain_pattern: Option<String>,
    pub match_sender_email_pattern: Option<String>,
    pub match_direction: Option<String>,
    pub action_assign_queue_id: Option<String>,
    pub action_assign_user_id: Option<String>,
    pub action_set_status: Option<String>,
    pub action_drop: bool,
    pub action_auto_close: bool,
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("ticket error: {0}")]
    Ticket(#[from] TicketError),
    #[error("rule may assign to a queue or a user, not both")]
    ConflictingAssignment,
    #[error("rule must set at least one action")]
    NoAction,
    #[error("referenced queue {0} does not exist in this organization")]
    UnknownQueue(String),
    #[error("referenced user {0} does not exist in this organization")]
    UnknownUser(String),
}

/// Shell-style glob match (`*`, `?`, `[...]`), case-folded. Patterns that do
/// not compile never match.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let pattern = pattern.trim().to_lowercase();
    if pattern.is_empty() {
        return false;
    }
    match Pattern::new(&pattern) {
        Ok(pattern) => pattern.matches(&value.to_lowercase()),
        Err(_) => false,
    }
}

/// A rule matches when every non-empty predicate matches.
pub fn rule_matches(
    rule: &RoutingRule,
    recipient: &str,
    sender_domain: &str,
    sender_email: &str,
    direction: Option<&str>,
) -> bool {
    if let Some(pattern) = non_empty(rule.match_recipient_pattern.as_deref()) {
        if !glob_match(pattern, recipient) {
            return false;
        }
    }
    if let Some(pattern) = non_empty(rule.match_sender_domain_pattern.as_deref()) {
        if !glob_match(pattern, sender_domain) {
            return false;
        }
    }
    if let Some(pattern) = non_empty(rule.match_sender_email_pattern.as_deref()) {
        if !glob_match(pattern, sender_email) {
            return false;
        }
    }
    if let (Some(wanted), Some(actual)) = (non_empty(rule.match_direction.as_deref()), direction) {
        if wanted != actual {
            return false;
        }
    }
    true
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Clone)]
pub struct RoutingRepository {
    db: Database,
}

impl RoutingRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn add_allowlist_pattern(
        &self,
        organization_id: &str,
        pattern: &str,
    ) -> Result<String, RoutingError> {
        let id = Uuid::new_v4().to_string();
        let conn = self.db.connection().await?;
        conn.execute(
            "INSERT INTO recipient_allowlist (id, organization_id, pattern, is_enabled, created_at)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![id.clone(), organization_id, pattern, now_rfc3339()],
        )
        .await?;
        Ok(id)
    }

    /// An empty recipient is never allowlisted.
    pub async fn is_allowlisted(
        &self,
        organization_id: &str,
        recipient: &str,
    ) -> Result<bool, RoutingError> {
        let recipient = recipient.trim().to_lowercase();
        if recipient.is_empty() {
            return Ok(false);
        }

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT pattern FROM recipient_allowlist
                 WHERE organization_id = ?1 AND is_enabled = 1",
                params![organization_id],
            )
            .await?;
        while let Some(row) = rows.next().await? {
            let pattern: String = row.get(0)?;
            if glob_match(&pattern, &recipient) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Admin-time validation: sane assignment, at least one action, and
    /// referenced queue/user rows present in the same organization.
    pub async fn create_rule(
        &self,
        organization_id: &str,
        new: NewRoutingRule,
    ) -> Result<RoutingRule, RoutingError> {
        if new.action_assign_queue_id.is_some() && new.action_assign_user_id.is_some() {
            return Err(RoutingError::ConflictingAssignment);
        }
        let has_action = new.action_assign_queue_id.is_some()
            || new.action_assign_user_id.is_some()
            || new.action_set_status.is_some()
            || new.action_drop
            || new.action_auto_close;
        if !has_action {
            return Err(RoutingError::NoAction);
        }

        let conn = self.db.connection().await?;
        if let Some(queue_id) = new.action_assign_queue_id.as_deref() {
            let mut rows = conn
                .query(
                    "SELECT id FROM queues WHERE organization_id = ?1 AND id = ?2",
                    params![organization_id, queue_id],
                )
                .await?;
            if rows.next().await?.is_none() {
                return Err(RoutingError::UnknownQueue(queue_id.to_string()));
            }
        }
        if let Some(user_id) = new.action_assign_user_id.as_deref() {
            let mut rows = conn
                .query(
                    "SELECT id FROM users WHERE organization_id = ?1 AND id = ?2",
                    params![organization_id, user_id],
                )
                .await?;
            if rows.next().await?.is_none() {
                return Err(RoutingError::UnknownUser(user_id.to_string()));
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO routing_rules (id, organization_id, name, is_enabled, priority, match_recipient_pattern, match_sender_domain_pattern, match_sender_email_pattern, match_direction, action_assign_queue_id, action_assign_user_id, action_set_status, action_drop, action_auto_close, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
                     RETURNING {RULE_COLUMNS}"
                ),
                params![
                    id,
                    organization_id,
                    new.name,
                    new.priority,
                    new.match_recipient_pattern,
                    new.match_sender_domain_pattern,
                    new.match_sender_email_pattern,
                    new.match_direction,
                    new.action_assign_queue_id,
                    new.action_assign_user_id,
                    new.action_set_status,
                    new.action_drop as i64,
                    new.action_auto_close as i64,
                    now
                ],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_to_rule(row),
            None => Err(RoutingError::Sql(libsql::Error::QueryReturnedNoRows)),
        }
    }

    /// Enabled rules in evaluation order: priority ascending, id as the
    /// tie-break.
    pub async fn list_enabled_rules(
        &self,
        organization_id: &str,
    ) -> Result<Vec<RoutingRule>, RoutingError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM routing_rules
                     WHERE organization_id = ?1 AND is_enabled = 1
                     ORDER BY priority ASC, id ASC"
                ),
                params![organization_id],
            )
            .await?;

        let mut rules = Vec::new();
        while let Some(row) = rows.next().await? {
            rules.push(row_to_rule(row)?);
        }
        Ok(rules)
    }

    /// Apply the rule's actions to the ticket in one UPDATE and return the
    /// before/after snapshots. `action_drop` records the decision without
    /// touching the ticket.
    pub async fn apply_rule_to_ticket(
        &self,
        organization_id: &str,
        ticket_id: &str,
        rule: &RoutingRule,
    ) -> Result<(TicketSnapshot, TicketSnapshot), RoutingError> {
        let tickets = TicketRepository::new(self.db.clone());
        let before = tickets.snapshot(organization_id, ticket_id).await?;

        let mut assignments: Vec<String> = Vec::new();
        let mut bound: Vec<libsql::Value> = vec![
            organization_id.to_string().into(),
            ticket_id.to_string().into(),
        ];

        if let Some(user_id) = rule.action_assign_user_id.as_deref() {
            bound.push(user_id.to_string().into());
            assignments.push(format!("assignee_user_id = ?{}", bound.len()));
            assignments.push("assignee_queue_id = NULL".to_string());
        } else if let Some(queue_id) = rule.action_assign_queue_id.as_deref() {
            bound.push(queue_id.to_string().into());
            assignments.push(format!("assignee_queue_id = ?{}", bound.len()));
            assignments.push("assignee_user_id = NULL".to_string());
        }

        // Auto-close overrides whatever status the rule would otherwise set.
        let target_status = if rule.action_auto_close {
            Some("closed".to_string())
        } else {
            rule.action_set_status.clone()
        };
        if let Some(status) = target_status {
            bound.push(status.into());
            assignments.push(format!("status = ?{}", bound.len()));
        }

        let now = now_rfc3339();
        if rule.action_auto_close {
            bound.push(now.clone().into());
            assignments.push(format!("closed_at = ?{}", bound.len()));
        }

        if !assignments.is_empty() {
            bound.push(now.into());
            assignments.push(format!("updated_at = ?{}", bound.len()));
            assignments.push(format!("last_activity_at = ?{}", bound.len()));

            let sql = format!(
                "UPDATE tickets SET {} WHERE organization_id = ?1 AND id = ?2",
                assignments.join(", ")
            );
            let conn = self.db.connection().await?;
            conn.execute(&sql, libsql::params_from_iter(bound)).await?;
        }

        let after = tickets.snapshot(organization_id, ticket_id).await?;
        Ok((before, after))
    }
}

fn row_to_rule(row: Row) -> Result<RoutingRule, RoutingError> {
    let is_enabled: i64 = row.get(3)?;
    let action_drop: i64 = row.get(12)?;
    let action_auto_close: i64 = row.get(13)?;

    Ok(RoutingRule {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        name: row.get(2)?,
        is_enabled: is_enabled != 0,
        priority: row.get(4)?,
        match_recipient_pattern: row.get(5)?,
        match_sender_domain_pattern: row.get(6)?,
        match_sender_email_pattern: row.get(7)?,
        match_direction: row.get(8)?,
        action_assign_queue_id: row.get(9)?,
        action_assign_user_id: row.get(10)?,
        action_set_status: row.get(11)?,
        action_drop: action_drop != 0,
        action_auto_close: action_auto_close != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_org, seed_queue_row, seed_user, setup_db};
    use crate::tickets::NewTicket;

    fn rule(priority: i64, recipient: Option<&str>) -> NewRoutingRule {
        NewRoutingRule {
            name: format!("rule-{priority}"),
            priority,
            match_recipient_pattern: recipient.map(|s| s.to_string()),
            action_set_status: Some("open".into()),
            ..NewRoutingRule::default()
        }
    }

    #[test]
    fn glob_matching_behaves_like_fnmatch() {
        assert!(glob_match("support@acme.test", "support@acme.test"));
        assert!(glob_match("*@acme.test", "billing@acme.test"));
        assert!(glob_match("support@*", "SUPPORT@ACME.TEST"));
        assert!(glob_match("supp?rt@acme.test", "support@acme.test"));
        assert!(glob_match("[st]upport@acme.test", "support@acme.test"));
        assert!(!glob_match("*@acme.test", "support@other.test"));
        assert!(!glob_match("", "anything"));
        assert!(!glob_match("[invalid", "anything"));
    }

    #[test]
    fn rule_requires_every_nonempty_predicate() {
        let rule = RoutingRule {
            id: "r1".into(),
            organization_id: "org".into(),
            name: "r".into(),
            is_enabled: true,
            priority: 10,
            match_recipient_pattern: Some("support@*".into()),
            match_sender_domain_pattern: Some("customer.test".into()),
            match_sender_email_pattern: None,
            match_direction: Some("inbound".into()),
            action_assign_queue_id: None,
            action_assign_user_id: None,
            action_set_status: Some("open".into()),
            action_drop: false,
            action_auto_close: false,
        };

        assert!(rule_matches(
            &rule,
            "support@acme.test",
            "customer.test",
            "a@customer.test",
            Some("inbound")
        ));
        assert!(!rule_matches(
            &rule,
            "billing@acme.test",
            "customer.test",
            "a@customer.test",
            Some("inbound")
        ));
        assert!(!rule_matches(
            &rule,
            "support@acme.test",
            "other.test",
            "a@other.test",
            Some("inbound")
        ));
        assert!(!rule_matches(
            &rule,
            "support@acme.test",
            "customer.test",
            "a@customer.test",
            Some("outbound")
        ));
        // Unknown direction leaves the direction predicate unevaluated.
        assert!(rule_matches(
            &rule,
            "support@acme.test",
            "customer.test",
            "a@customer.test",
            None
        ));
    }

    #[tokio::test]
    async fn allowlist_uses_globs_and_skips_disabled() {
        let (db, _dir) = setup_db().await;
        let org = seed_org(&db).await;
        let repo = RoutingRepository::new(db.clone());

        repo.add_allowlist_pattern(&org, "*@acme.test")
            .await
            .expect("add pattern");
        let disabled = repo
            .add_allowlist_pattern(&org, "*@secret.test")
            .await
            .expect("add disabled");
        let conn = db.connection().await.expect("conn");
        conn.execute(
            "UPDATE recipient_allowlist SET is_enabled = 0 WHERE id = ?1",
            params![disabled.as_str()],
        )
        .await
        .expect("disable");

        assert!(repo.is_allowlisted(&org, "support@acme.test").await.expect("check"));
        assert!(repo.is_allowlisted(&org, "SUPPORT@ACME.TEST").await.expect("check"));
        assert!(!repo.is_allowlisted(&org, "x@secret.test").await.expect("check"));
        assert!(!repo.is_allowlisted(&org, "x@other.test").await.expect("check"));
        assert!(!repo.is_allowlisted(&org, "").await.expect("check"));
    }

    #[tokio::test]
    async fn rule_validation_enforces_references_and_actions() {
        let (db, _dir) = setup_db().await;
        let org = seed_org(&db).await;
        let repo = RoutingRepository::new(db.clone());

        let err = repo
            .create_rule(&org, NewRoutingRule { name: "empty".into(), priority: 1, ..NewRoutingRule::default() })
            .await
            .expect_err("no action");
        assert!(matches!(err, RoutingError::NoAction));

        let err = repo
            .create_rule(
                &org,
                NewRoutingRule {
                    name: "both".into(),
                    priority: 1,
                    action_assign_queue_id: Some("q".into()),
                    action_assign_user_id: Some("u".into()),
                    ..NewRoutingRule::default()
                },
            )
            .await
            .expect_err("both assignments");
        assert!(matches!(err, RoutingError::ConflictingAssignment));

        let err = repo
            .create_rule(
                &org,
                NewRoutingRule {
                    name: "ghost queue".into(),
                    priority: 1,
                    action_assign_queue_id: Some("missing".into()),
                    ..NewRoutingRule::default()
                },
            )
            .await
            .expect_err("unknown queue");
        assert!(matches!(err, RoutingError::UnknownQueue(_)));

        let queue_id = seed_queue_row(&db, &org, "Tier 1").await;
        let user_id = seed_user(&db, &org, "agent@acme.test").await;

        repo.create_rule(
            &org,
            NewRoutingRule {
                name: "queue rule".into(),
                priority: 10,
                action_assign_queue_id: Some(queue_id),
                ..NewRoutingRule::default()
            },
        )
        .await
        .expect("queue rule");
        repo.create_rule(
            &org,
            NewRoutingRule {
                name: "user rule".into(),
                priority: 20,
                action_assign_user_id: Some(user_id),
                ..NewRoutingRule::default()
            },
        )
        .await
        .expect("user rule");

        let rules = repo.list_enabled_rules(&org).await.expect("list");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].priority, 10);
        assert_eq!(rules[1].priority, 20);
    }

    #[tokio::test]
    async fn apply_rule_updates_ticket_and_snapshots() {
        let (db, _dir) = setup_db().await;
        let org = seed_org(&db).await;
        let repo = RoutingRepository::new(db.clone());
        let tickets = TicketRepository::new(db.clone());
        let queue_id = seed_queue_row(&db, &org, "Tier 1").await;

        let ticket = tickets
            .create(
                &org,
                NewTicket {
                    subject: Some("Hello".into()),
                    stitch_reason: "new_message".into(),
                    stitch_confidence: "low".into(),
                    ..NewTicket::default()
                },
            )
            .await
            .expect("ticket");

        let rule = repo
            .create_rule(
                &org,
                NewRoutingRule {
                    name: "assign + open".into(),
                    priority: 10,
                    action_assign_queue_id: Some(queue_id.clone()),
                    action_set_status: Some("open".into()),
                    ..NewRoutingRule::default()
                },
            )
            .await
            .expect("rule");

        let (before, after) = repo
            .apply_rule_to_ticket(&org, &ticket.id, &rule)
            .await
            .expect("apply");
        assert_eq!(before.status, "new");
        assert_eq!(after.status, "open");
        assert_eq!(after.assignee_queue_id.as_deref(), Some(queue_id.as_str()));

        let stored = tickets.get(&org, &ticket.id).await.expect("get");
        assert_eq!(stored.status, "open");
        assert!(stored.last_activity_at.is_some());
    }

    #[tokio::test]
    async fn auto_close_overrides_set_status() {
        let (db, _dir) = setup_db().await;
        let org = seed_org(&db).await;
        let repo = RoutingRepository::new(db.clone());
        let tickets = TicketRepository::new(db.clone());

        let ticket = tickets
            .create(
                &org,
                NewTicket {
                    stitch_reason: "new_message".into(),
                    stitch_confidence: "low".into(),
                    ..NewTicket::default()
                },
            )
            .await
            .expect("ticket");

        let rule = repo
            .create_rule(
                &org,
                NewRoutingRule {
                    name: "close".into(),
                    priority: 5,
                    action_set_status: Some("pending".into()),
                    action_auto_close: true,
                    ..NewRoutingRule::default()
                },
            )
            .await
            .expect("rule");

        let (_, after) = repo
            .apply_rule_to_ticket(&org, &ticket.id, &rule)
            .await
            .expect("apply");
        assert_eq!(after.status, "closed");
        let stored = tickets.get(&org, &ticket.id).await.expect("get");
        assert!(stored.closed_at.is_some());
    }

    #[tokio::test]
    async fn drop_rule_records_without_mutation() {
        let (db, _dir) = setup_db().await;
        let org = seed_org(&db).await;
        let repo = RoutingRepository::new(db.clone());
        let tickets = TicketRepository::new(db.clone());

        let ticket = tickets
            .create(
                &org,
                NewTicket {
                    stitch_reason: "new_message".into(),
                    stitch_confidence: "low".into(),
                    ..NewTicket::default()
                },
            )
            .await
            .expect("ticket");

        let rule = repo
            .create_rule(
                &org,
                NewRoutingRule {
                    name: "drop".into(),
                    priority: 1,
                    action_drop: true,
                    ..NewRoutingRule::default()
                },
            )
            .await
            .expect("rule");

        let (before, after) = repo
            .apply_rule_to_ticket(&org, &ticket.id, &rule)
            .await
            .expect("apply");
        assert_eq!(before, after, "drop does not alter the ticket");
        assert_eq!(after.status, "new");
    }
}
