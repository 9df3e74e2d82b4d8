//! Archived thread storage (§4.D).
//!
//! A thread is archived once its terminal message reaches `completed` or
//! `failed` and the mailbox sweep evicts it (§4.A). The archive is the
//! source of truth for thread history; the mailbox's JSON snapshot is a
//! cache of in-flight state only (§9).

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::storage::with_timeout;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedThread {
    pub id: String,
    pub thread_id: String,
    pub participants: Vec<String>,
    pub first_message_at: String,
    pub last_message_at: String,
    pub messages: Value,
    pub metadata: Option<Value>,
    pub created_at: String,
}

#[derive(sqlx::FromRow)]
struct ArchivedThreadRow {
    id: String,
    thread_id: String,
    participants: String,
    first_message_at: String,
    last_message_at: String,
    messages: String,
    metadata: Option<String>,
    created_at: String,
}

impl TryFrom<ArchivedThreadRow> for ArchivedThread {
    type Error = anyhow::Error;

    fn try_from(r: ArchivedThreadRow) -> Result<Self> {
        Ok(ArchivedThread {
            id: r.id,
            thread_id: r.thread_id,
            participants: serde_json::from_str(&r.participants)?,
            first_message_at: r.first_message_at,
            last_message_at: r.last_message_at,
            messages: serde_json::from_str(&r.messages)?,
            metadata: r.metadata.and_then(|m| serde_json::from_str(&m).ok()),
            created_at: r.created_at,
        })
    }
}

/// Archived-thread store, SQLite-backed (§4.D, §6 persisted layout).
#[derive(Clone)]
pub struct ArchiveStore {
    pool: SqlitePool,
}

impl ArchiveStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a completed/failed thread. `messages` is the full ordered
    /// message list for the thread (§9 "archive preserves the full path").
    pub async fn archive_thread(
        &self,
        thread_id: &str,
        participants: &[String],
        first_message_at: &str,
        last_message_at: &str,
        messages: Value,
        metadata: Option<Value>,
    ) -> Result<ArchivedThread> {
        with_timeout(async {
            let id = Uuid::new_v4().to_string();
            let created_at = Utc::now().to_rfc3339();
            let participants_json = serde_json::to_string(participants)?;
            let messages_json = messages.to_string();
            let metadata_json = metadata.as_ref().map(|m| m.to_string());

            sqlx::query(
                "INSERT INTO archived_threads
                 (id, thread_id, participants, first_message_at, last_message_at, messages, metadata, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(thread_id)
            .bind(&participants_json)
            .bind(first_message_at)
            .bind(last_message_at)
            .bind(&messages_json)
            .bind(&metadata_json)
            .bind(&created_at)
            .execute(&self.pool)
            .await?;

            Ok(ArchivedThread {
                id,
                thread_id: thread_id.to_string(),
                participants: participants.to_vec(),
                first_message_at: first_message_at.to_string(),
                last_message_at: last_message_at.to_string(),
                messages,
                metadata,
                created_at,
            })
        })
        .await
    }

    /// Most recently archived copy of a thread, if any (a thread may be
    /// archived more than once if it somehow reopens — last write wins).
    pub async fn latest_for_thread(&self, thread_id: &str) -> Result<Option<ArchivedThread>> {
        with_timeout(async {
            let row = sqlx::query_as::<_, ArchivedThreadRow>(
                "SELECT * FROM archived_threads WHERE thread_id = ? ORDER BY created_at DESC LIMIT 1",
            )
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?;

            row.map(TryFrom::try_from).transpose()
        })
        .await
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<ArchivedThread>> {
        with_timeout(async {
            let rows = sqlx::query_as::<_, ArchivedThreadRow>(
                "SELECT * FROM archived_threads ORDER BY created_at DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

            rows.into_iter().map(TryFrom::try_from).collect()
        })
        .await
    }

    /// Total archived-thread rows, for the metrics endpoint (SPEC_FULL §10).
    pub async fn count(&self) -> Result<i64> {
        with_timeout(async {
            let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM archived_threads")
                .fetch_one(&self.pool)
                .await?;
            Ok(row.0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> ArchiveStore {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        for stmt in include_str!("../storage/migrations/001_init.sql").split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(&pool).await.unwrap();
            }
        }
        ArchiveStore::new(pool)
    }

    #[tokio::test]
    async fn archive_and_lookup_roundtrip() {
        let store = store().await;
        let participants = vec!["cursor/dev".to_string(), "replit/main".to_string()];
        let messages = serde_json::json!([{"id": "m1", "task": "ship it"}]);

        store
            .archive_thread(
                "thread-1",
                &participants,
                "2026-07-28T00:00:00Z",
                "2026-07-28T01:00:00Z",
                messages.clone(),
                None,
            )
            .await
            .unwrap();

        let found = store.latest_for_thread("thread-1").await.unwrap().unwrap();
        assert_eq!(found.thread_id, "thread-1");
        assert_eq!(found.participants, participants);
        assert_eq!(found.messages, messages);
    }

    #[tokio::test]
    async fn latest_for_thread_picks_most_recent() {
        let store = store().await;
        store
            .archive_thread(
                "thread-2",
                &[],
                "2026-07-28T00:00:00Z",
                "2026-07-28T00:10:00Z",
                serde_json::json!([{"id": "first"}]),
                None,
            )
            .await
            .unwrap();
        store
            .archive_thread(
                "thread-2",
                &[],
                "2026-07-28T00:00:00Z",
                "2026-07-28T02:00:00Z",
                serde_json::json!([{"id": "second"}]),
                None,
            )
            .await
            .unwrap();

        let found = store.latest_for_thread("thread-2").await.unwrap().unwrap();
        assert_eq!(found.messages, serde_json::json!([{"id": "second"}]));
    }

    #[tokio::test]
    async fn unknown_thread_returns_none() {
        let store = store().await;
        assert!(store.latest_for_thread("nope").await.unwrap().is_none());
    }
}
