//! Flight Recorder (§4.H).
//!
//! A durable per-agent journal of thoughts, checkpoints, and errors,
//! grouped into sessions, with deterministic resumption-prompt synthesis
//! so a restarting agent can recover context.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::storage::with_timeout;

const SESSION_ACTIVITY_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryType {
    Thought,
    Error,
    Checkpoint,
    Message,
}

impl EntryType {
    fn as_str(self) -> &'static str {
        match self {
            EntryType::Thought => "THOUGHT",
            EntryType::Error => "ERROR",
            EntryType::Checkpoint => "CHECKPOINT",
            EntryType::Message => "MESSAGE",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "THOUGHT" => EntryType::Thought,
            "ERROR" => EntryType::Error,
            "CHECKPOINT" => EntryType::Checkpoint,
            "MESSAGE" => EntryType::Message,
            other => return Err(anyhow!("unknown journal entry type '{other}'")),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub current_task: Option<String>,
    pub last_file_edited: Option<String>,
    pub blocking_issue: Option<String>,
    pub recent_decisions: Vec<String>,
    #[serde(default)]
    pub custom: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub ts: DateTime<Utc>,
    pub entry_type: EntryType,
    pub content: String,
    pub context_snapshot: Option<ContextSnapshot>,
    pub target_agent: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderSession {
    pub id: String,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub entry_count: i64,
    pub is_active: bool,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    agent_id: String,
    created_at: String,
    last_activity: String,
    entry_count: i64,
    is_active: i64,
}

impl TryFrom<SessionRow> for RecorderSession {
    type Error = anyhow::Error;

    fn try_from(r: SessionRow) -> Result<Self> {
        Ok(RecorderSession {
            id: r.id,
            agent_id: r.agent_id,
            created_at: DateTime::parse_from_rfc3339(&r.created_at)?.with_timezone(&Utc),
            last_activity: DateTime::parse_from_rfc3339(&r.last_activity)?.with_timezone(&Utc),
            entry_count: r.entry_count,
            is_active: r.is_active != 0,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: String,
    session_id: String,
    agent_id: String,
    ts: String,
    entry_type: String,
    content: String,
    context_snapshot: Option<String>,
    target_agent: Option<String>,
    tags: Option<String>,
}

impl TryFrom<EntryRow> for JournalEntry {
    type Error = anyhow::Error;

    fn try_from(r: EntryRow) -> Result<Self> {
        Ok(JournalEntry {
            id: r.id,
            session_id: r.session_id,
            agent_id: r.agent_id,
            ts: DateTime::parse_from_rfc3339(&r.ts)?.with_timezone(&Utc),
            entry_type: EntryType::parse(&r.entry_type)?,
            content: r.content,
            context_snapshot: r
                .context_snapshot
                .and_then(|s| serde_json::from_str(&s).ok()),
            target_agent: r.target_agent,
            tags: r
                .tags
                .and_then(|t| serde_json::from_str(&t).ok())
                .unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSummary {
    pub summary_text: String,
    pub immediate_goal: String,
    pub key_decisions: Vec<String>,
    pub unresolved_issues: Vec<String>,
}

/// Flight Recorder, SQLite-backed (§4.H, §6 persisted layout).
#[derive(Clone)]
pub struct FlightRecorder {
    pool: SqlitePool,
}

impl FlightRecorder {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// §4.H "Session selection on log": explicit id wins (insert-or-noop);
    /// else reuse the most recent active session within the 24h window;
    /// else start a new one.
    pub async fn get_or_create_session(
        &self,
        agent_id: &str,
        explicit_session_id: Option<&str>,
    ) -> Result<RecorderSession> {
        with_timeout(async {
            if let Some(id) = explicit_session_id {
                if let Some(existing) = self.get_session(id).await? {
                    return Ok(existing);
                }
                return self.insert_session(id, agent_id).await;
            }

            let cutoff = (Utc::now() - Duration::hours(SESSION_ACTIVITY_WINDOW_HOURS)).to_rfc3339();
            let row = sqlx::query_as::<_, SessionRow>(
                "SELECT * FROM recorder_sessions
                 WHERE agent_id = ? AND is_active = 1 AND last_activity > ?
                 ORDER BY last_activity DESC LIMIT 1",
            )
            .bind(agent_id)
            .bind(&cutoff)
            .fetch_optional(&self.pool)
            .await?;

            match row {
                Some(r) => r.try_into(),
                None => {
                    let id = Uuid::new_v4().to_string();
                    self.insert_session(&id, agent_id).await
                }
            }
        })
        .await
    }

    async fn insert_session(&self, id: &str, agent_id: &str) -> Result<RecorderSession> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO recorder_sessions (id, agent_id, created_at, last_activity, entry_count, is_active)
             VALUES (?, ?, ?, ?, 0, 1)",
        )
        .bind(id)
        .bind(agent_id)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(RecorderSession {
            id: id.to_string(),
            agent_id: agent_id.to_string(),
            created_at: now,
            last_activity: now,
            entry_count: 0,
            is_active: true,
        })
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<RecorderSession>> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM recorder_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryFrom::try_from).transpose()
    }

    /// Closes any existing active session for the agent, then opens a
    /// fresh one.
    pub async fn start_new_session(&self, agent_id: &str) -> Result<RecorderSession> {
        with_timeout(async {
            self.close_agent_sessions(agent_id).await?;
            let id = Uuid::new_v4().to_string();
            self.insert_session(&id, agent_id).await
        })
        .await
    }

    pub async fn close_session(&self, id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE recorder_sessions SET is_active = 0 WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn close_agent_sessions(&self, agent_id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE recorder_sessions SET is_active = 0 WHERE agent_id = ? AND is_active = 1")
                .bind(agent_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn save_entry(
        &self,
        agent_id: &str,
        explicit_session_id: Option<&str>,
        entry_type: EntryType,
        content: &str,
        context_snapshot: Option<ContextSnapshot>,
        target_agent: Option<&str>,
        tags: Vec<String>,
    ) -> Result<JournalEntry> {
        with_timeout(async {
            let session = self.get_or_create_session(agent_id, explicit_session_id).await?;
            let id = Uuid::new_v4().to_string();
            let ts = Utc::now();
            let snapshot_json = context_snapshot
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let tags_json = serde_json::to_string(&tags)?;

            sqlx::query(
                "INSERT INTO recorder_entries
                 (id, session_id, agent_id, ts, entry_type, content, context_snapshot, target_agent, tags)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&session.id)
            .bind(agent_id)
            .bind(ts.to_rfc3339())
            .bind(entry_type.as_str())
            .bind(content)
            .bind(&snapshot_json)
            .bind(target_agent)
            .bind(&tags_json)
            .execute(&self.pool)
            .await?;

            sqlx::query(
                "UPDATE recorder_sessions SET entry_count = entry_count + 1, last_activity = ? WHERE id = ?",
            )
            .bind(ts.to_rfc3339())
            .bind(&session.id)
            .execute(&self.pool)
            .await?;

            Ok(JournalEntry {
                id,
                session_id: session.id,
                agent_id: agent_id.to_string(),
                ts,
                entry_type,
                content: content.to_string(),
                context_snapshot,
                target_agent: target_agent.map(str::to_string),
                tags,
            })
        })
        .await
    }

    pub async fn get_context_for_session(&self, session_id: &str, limit: i64) -> Result<ContextSummary> {
        let entries = self.recent_entries_for_session(session_id, limit).await?;
        Ok(synthesize(&entries))
    }

    pub async fn get_context_for_agent(&self, agent_id: &str, limit: i64) -> Result<ContextSummary> {
        let entries = self.recent_entries_for_agent(agent_id, limit).await?;
        Ok(synthesize(&entries))
    }

    async fn recent_entries_for_session(&self, session_id: &str, limit: i64) -> Result<Vec<JournalEntry>> {
        with_timeout(async {
            let rows = sqlx::query_as::<_, EntryRow>(
                "SELECT * FROM recorder_entries WHERE session_id = ? ORDER BY ts DESC LIMIT ?",
            )
            .bind(session_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(TryFrom::try_from).collect()
        })
        .await
    }

    async fn recent_entries_for_agent(&self, agent_id: &str, limit: i64) -> Result<Vec<JournalEntry>> {
        with_timeout(async {
            let rows = sqlx::query_as::<_, EntryRow>(
                "SELECT * FROM recorder_entries WHERE agent_id = ? ORDER BY ts DESC LIMIT ?",
            )
            .bind(agent_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(TryFrom::try_from).collect()
        })
        .await
    }

    /// §4.H "Resumption prompt": a pure function of the last-N entries
    /// (invariant 10). `entries` must already be newest-first, matching
    /// what `recent_entries_for_agent`/`_session` return.
    pub async fn generate_universal_script(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
    ) -> Result<String> {
        let entries = match session_id {
            Some(sid) => self.recent_entries_for_session(sid, 50).await?,
            None => self.recent_entries_for_agent(agent_id, 50).await?,
        };
        Ok(resumption_prompt(agent_id, &entries))
    }
}

/// §4.H "Context synthesis": walk newest→oldest, adopt the first
/// context_snapshot seen as latest, count errors, build the summary.
fn synthesize(entries_newest_first: &[JournalEntry]) -> ContextSummary {
    let mut latest_snapshot: Option<&ContextSnapshot> = None;
    let mut errors: Vec<&JournalEntry> = Vec::new();

    for entry in entries_newest_first {
        if latest_snapshot.is_none() {
            if let Some(snap) = &entry.context_snapshot {
                latest_snapshot = Some(snap);
            }
        }
        if entry.entry_type == EntryType::Error {
            errors.push(entry);
        }
    }

    let summary_text = match latest_snapshot.and_then(|s| s.current_task.as_ref()) {
        Some(task) => format!("Working on: {task}"),
        None => "No context available".to_string(),
    };

    let immediate_goal = if let Some(err) = errors.first() {
        format!("Fix error: {}", truncate(&err.content, 80))
    } else if let Some(blocking) = latest_snapshot.and_then(|s| s.blocking_issue.as_ref()) {
        blocking.clone()
    } else {
        "Continue work".to_string()
    };

    let key_decisions = latest_snapshot
        .map(|s| s.recent_decisions.clone())
        .unwrap_or_default();

    let unresolved_issues = errors
        .iter()
        .take(2)
        .map(|e| truncate(&e.content, 60))
        .collect();

    ContextSummary {
        summary_text,
        immediate_goal,
        key_decisions,
        unresolved_issues,
    }
}

/// §4.H "Resumption prompt": fixed template + summary + recent logs,
/// last 10 entries reversed into chronological order.
fn resumption_prompt(agent_id: &str, entries_newest_first: &[JournalEntry]) -> String {
    let summary = synthesize(entries_newest_first);
    let mut prompt = String::new();

    prompt.push_str("You are resuming a prior session. Do not restart from scratch.\n\n");
    prompt.push_str(&format!("AGENT: {agent_id}\n"));
    prompt.push_str(&format!("SUMMARY: {}\n", summary.summary_text));
    prompt.push_str(&format!("IMMEDIATE GOAL: {}\n", summary.immediate_goal));

    if !summary.unresolved_issues.is_empty() {
        prompt.push_str("\nUNRESOLVED ISSUES:\n");
        for issue in &summary.unresolved_issues {
            prompt.push_str(&format!("- {issue}\n"));
        }
    }

    prompt.push_str("\nRECENT LOGS:\n");
    for entry in entries_newest_first.iter().take(10).rev() {
        prompt.push_str(&format!(
            "- [{}] {}: {}\n",
            entry.ts.format("%H:%M"),
            entry.entry_type.as_str(),
            truncate(&entry.content, 100)
        ));
    }

    prompt.push_str("\nAcknowledge this context and state your next step before proceeding.\n");
    prompt
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn recorder() -> FlightRecorder {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        for stmt in include_str!("../storage/migrations/001_init.sql").split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(&pool).await.unwrap();
            }
        }
        FlightRecorder::new(pool)
    }

    #[tokio::test]
    async fn logging_without_session_creates_one() {
        let r = recorder().await;
        let entry = r
            .save_entry("cursor/dev", None, EntryType::Thought, "thinking", None, None, vec![])
            .await
            .unwrap();
        assert!(!entry.session_id.is_empty());

        let session = r.get_session(&entry.session_id).await.unwrap().unwrap();
        assert_eq!(session.entry_count, 1);
        assert!(session.is_active);
    }

    #[tokio::test]
    async fn reuses_active_session_within_window() {
        let r = recorder().await;
        let first = r
            .save_entry("cursor/dev", None, EntryType::Thought, "one", None, None, vec![])
            .await
            .unwrap();
        let second = r
            .save_entry("cursor/dev", None, EntryType::Thought, "two", None, None, vec![])
            .await
            .unwrap();
        assert_eq!(first.session_id, second.session_id);
    }

    #[tokio::test]
    async fn start_new_session_closes_previous() {
        let r = recorder().await;
        let first = r.get_or_create_session("cursor/dev", None).await.unwrap();
        let second = r.start_new_session("cursor/dev").await.unwrap();

        assert_ne!(first.id, second.id);
        let reloaded = r.get_session(&first.id).await.unwrap().unwrap();
        assert!(!reloaded.is_active);
    }

    #[tokio::test]
    async fn context_synthesis_picks_first_snapshot_and_counts_errors() {
        let r = recorder().await;
        let session = r.start_new_session("cursor/dev").await.unwrap();

        r.save_entry(
            "cursor/dev",
            Some(&session.id),
            EntryType::Checkpoint,
            "checkpoint",
            Some(ContextSnapshot {
                current_task: Some("ship the relay".to_string()),
                recent_decisions: vec!["use sqlite".to_string()],
                ..Default::default()
            }),
            None,
            vec![],
        )
        .await
        .unwrap();

        r.save_entry(
            "cursor/dev",
            Some(&session.id),
            EntryType::Error,
            "panic in dispatcher",
            None,
            None,
            vec![],
        )
        .await
        .unwrap();

        let summary = r.get_context_for_session(&session.id, 10).await.unwrap();
        assert_eq!(summary.summary_text, "Working on: ship the relay");
        assert_eq!(summary.immediate_goal, "Fix error: panic in dispatcher");
        assert_eq!(summary.key_decisions, vec!["use sqlite".to_string()]);
    }

    #[tokio::test]
    async fn resumption_prompt_is_deterministic() {
        let r = recorder().await;
        let session = r.start_new_session("cursor/dev").await.unwrap();
        r.save_entry(
            "cursor/dev",
            Some(&session.id),
            EntryType::Thought,
            "first thought",
            None,
            None,
            vec![],
        )
        .await
        .unwrap();

        let first = r.generate_universal_script("cursor/dev", Some(&session.id)).await.unwrap();
        let second = r.generate_universal_script("cursor/dev", Some(&session.id)).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn no_context_available_when_no_snapshot_seen() {
        let r = recorder().await;
        let session = r.start_new_session("cursor/dev").await.unwrap();
        r.save_entry(
            "cursor/dev",
            Some(&session.id),
            EntryType::Thought,
            "no snapshot here",
            None,
            None,
            vec![],
        )
        .await
        .unwrap();

        let summary = r.get_context_for_session(&session.id, 10).await.unwrap();
        assert_eq!(summary.summary_text, "No context available");
        assert_eq!(summary.immediate_goal, "Continue work");
    }
}
