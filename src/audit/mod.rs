//! Append-only audit log (§4.D).
//!
//! Every lifecycle mutation in the mailbox store, plus registry/key/webhook
//! mutations, emits exactly one entry here. Writes are best-effort: a
//! failure to audit must never fail — or roll back — the operation being
//! audited (§7 "Durable store failure ... audit writes are best-effort").

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::warn;

use crate::storage::with_timeout;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: i64,
    pub ts: String,
    pub action: String,
    pub actor: String,
    pub target_type: String,
    pub target_id: String,
    pub details: Option<Value>,
    pub source: Option<String>,
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: i64,
    ts: String,
    action: String,
    actor: String,
    target_type: String,
    target_id: String,
    details: Option<String>,
    source: Option<String>,
}

impl From<AuditRow> for AuditEntry {
    fn from(r: AuditRow) -> Self {
        AuditEntry {
            id: r.id,
            ts: r.ts,
            action: r.action,
            actor: r.actor,
            target_type: r.target_type,
            target_id: r.target_id,
            details: r.details.and_then(|d| serde_json::from_str(&d).ok()),
            source: r.source,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct AuditQuery {
    pub action: Option<String>,
    pub actor: Option<String>,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStats {
    pub total: i64,
    pub last_24h: i64,
    pub top_actions: Vec<(String, i64)>,
    pub top_actors: Vec<(String, i64)>,
}

/// Append-only audit log, SQLite-backed (§4.D, §6 persisted layout).
#[derive(Clone)]
pub struct AuditLog {
    pool: SqlitePool,
}

impl AuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record one lifecycle event. Errors are logged and swallowed — the
    /// caller's mutating operation must proceed regardless (§7).
    pub async fn record(
        &self,
        action: &str,
        actor: &str,
        target_type: &str,
        target_id: &str,
        details: Option<Value>,
        source: Option<&str>,
    ) {
        if let Err(e) = self
            .try_record(action, actor, target_type, target_id, details, source)
            .await
        {
            warn!(err = %e, action, "audit write failed");
        }
    }

    async fn try_record(
        &self,
        action: &str,
        actor: &str,
        target_type: &str,
        target_id: &str,
        details: Option<Value>,
        source: Option<&str>,
    ) -> Result<()> {
        let ts = Utc::now().to_rfc3339();
        let details_json = details.map(|d| d.to_string());
        sqlx::query(
            "INSERT INTO audit_log (ts, action, actor, target_type, target_id, details, source)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&ts)
        .bind(action)
        .bind(actor)
        .bind(target_type)
        .bind(target_id)
        .bind(&details_json)
        .bind(source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn query(&self, q: &AuditQuery) -> Result<Vec<AuditEntry>> {
        with_timeout(async {
            let mut sql = String::from("SELECT * FROM audit_log WHERE 1=1");
            if q.action.is_some() {
                sql.push_str(" AND action = ?");
            }
            if q.actor.is_some() {
                sql.push_str(" AND actor = ?");
            }
            if q.target_type.is_some() {
                sql.push_str(" AND target_type = ?");
            }
            if q.target_id.is_some() {
                sql.push_str(" AND target_id = ?");
            }
            if q.since.is_some() {
                sql.push_str(" AND ts >= ?");
            }
            if q.until.is_some() {
                sql.push_str(" AND ts <= ?");
            }
            sql.push_str(" ORDER BY id DESC LIMIT ? OFFSET ?");

            let mut query = sqlx::query_as::<_, AuditRow>(&sql);
            if let Some(v) = &q.action {
                query = query.bind(v);
            }
            if let Some(v) = &q.actor {
                query = query.bind(v);
            }
            if let Some(v) = &q.target_type {
                query = query.bind(v);
            }
            if let Some(v) = &q.target_id {
                query = query.bind(v);
            }
            if let Some(v) = &q.since {
                query = query.bind(v);
            }
            if let Some(v) = &q.until {
                query = query.bind(v);
            }
            query = query.bind(q.limit).bind(q.offset);

            let rows = query.fetch_all(&self.pool).await?;
            Ok(rows.into_iter().map(Into::into).collect())
        })
        .await
    }

    pub async fn stats(&self) -> Result<AuditStats> {
        with_timeout(async {
            let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_log")
                .fetch_one(&self.pool)
                .await?;

            let since = (Utc::now() - chrono::Duration::hours(24)).to_rfc3339();
            let last_24h: (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM audit_log WHERE ts >= ?")
                    .bind(&since)
                    .fetch_one(&self.pool)
                    .await?;

            let top_actions: Vec<(String, i64)> = sqlx::query_as(
                "SELECT action, COUNT(*) as c FROM audit_log GROUP BY action ORDER BY c DESC LIMIT 10",
            )
            .fetch_all(&self.pool)
            .await?;

            let top_actors: Vec<(String, i64)> = sqlx::query_as(
                "SELECT actor, COUNT(*) as c FROM audit_log GROUP BY actor ORDER BY c DESC LIMIT 10",
            )
            .fetch_all(&self.pool)
            .await?;

            Ok(AuditStats {
                total: total.0,
                last_24h: last_24h.0,
                top_actions,
                top_actors,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn log() -> AuditLog {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        for stmt in include_str!("../storage/migrations/001_init.sql").split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(&pool).await.unwrap();
            }
        }
        AuditLog::new(pool)
    }

    #[tokio::test]
    async fn record_and_query_roundtrip() {
        let log = log().await;
        log.record(
            "message.send",
            "cursor/dev",
            "message",
            "msg-1",
            Some(serde_json::json!({"to": "replit/main"})),
            None,
        )
        .await;

        let q = AuditQuery::new();
        let entries = log.query(&q).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "message.send");
        assert_eq!(entries[0].actor, "cursor/dev");
    }

    #[tokio::test]
    async fn query_filters_by_action() {
        let log = log().await;
        log.record("message.send", "a", "message", "1", None, None).await;
        log.record("message.approve", "a", "message", "1", None, None).await;

        let mut q = AuditQuery::new();
        q.action = Some("message.approve".to_string());
        let entries = log.query(&q).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "message.approve");
    }

    #[tokio::test]
    async fn stats_counts_totals_and_top_actions() {
        let log = log().await;
        log.record("message.send", "a", "message", "1", None, None).await;
        log.record("message.send", "b", "message", "2", None, None).await;
        log.record("message.approve", "a", "message", "1", None, None).await;

        let stats = log.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.top_actions[0].0, "message.send");
        assert_eq!(stats.top_actions[0].1, 2);
    }
}
