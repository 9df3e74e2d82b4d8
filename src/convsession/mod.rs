//! Conversation Session Registry (§4.I): turn-by-turn bookkeeping for a
//! two-agent thread, JSON-snapshot backed with a periodic janitor.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::mailbox::{snapshot, ControlType};

const SESSION_TTL_HOURS: i64 = 24;
const JANITOR_INTERVAL_SECS: u64 = 15 * 60;
const DISCARD_AFTER_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    AwaitingReply,
    AwaitingHuman,
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSession {
    pub key: String,
    pub participants: Vec<String>,
    pub status: ConversationStatus,
    pub current_turn: String,
    pub turn_count: u32,
    pub message_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// `agent:<from>:to:<to>:thread:<threadId>`, normalized (§4.I).
pub fn session_key(from: &str, to: &str, thread_id: &str) -> String {
    let norm = |s: &str| s.trim_start_matches('/').to_lowercase();
    format!("agent:{}:to:{}:thread:{}", norm(from), norm(to), norm(thread_id))
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionFile {
    sessions: Vec<ConversationSession>,
}

pub struct ConversationRegistry {
    path: PathBuf,
    state: Mutex<HashMap<String, ConversationSession>>,
}

impl ConversationRegistry {
    pub async fn new(data_dir: &std::path::Path) -> Result<Self> {
        let path = data_dir.join("sessions.json");
        let file: SessionFile = snapshot::read_or_default(&path).await?;
        let state = file.sessions.into_iter().map(|s| (s.key.clone(), s)).collect();
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    async fn persist(&self, state: &HashMap<String, ConversationSession>) -> Result<()> {
        let file = SessionFile {
            sessions: state.values().cloned().collect(),
        };
        snapshot::write_atomic(&self.path, &file).await
    }

    /// §4.I "On new send": create or update the session for
    /// `(from, to, threadId)`.
    pub async fn on_send(
        &self,
        from: &str,
        to: &str,
        thread_id: &str,
        control_type: Option<ControlType>,
    ) -> Result<ConversationSession> {
        let key = session_key(from, to, thread_id);
        let now = Utc::now();

        let mut state = self.state.lock().await;
        let session = state.entry(key.clone()).or_insert_with(|| ConversationSession {
            key: key.clone(),
            participants: Vec::new(),
            status: ConversationStatus::Active,
            current_turn: from.to_string(),
            turn_count: 0,
            message_count: 0,
            created_at: now,
            last_message_at: now,
            expires_at: now + Duration::hours(SESSION_TTL_HOURS),
            completed_at: None,
        });

        session.message_count += 1;
        session.last_message_at = now;
        session.expires_at = now + Duration::hours(SESSION_TTL_HOURS);

        let mut participants: HashSet<String> = session.participants.iter().cloned().collect();
        let added_from = participants.insert(from.to_string());
        let added_to = participants.insert(to.to_string());
        if added_from || added_to {
            session.participants = participants.into_iter().collect();
            session.participants.sort();
        }

        if session.current_turn == from {
            session.current_turn = to.to_string();
            session.turn_count += 1;
        }

        match control_type {
            Some(ControlType::ConversationEnd) => {
                session.status = ConversationStatus::Completed;
                session.completed_at = Some(now);
            }
            Some(ControlType::ReplySkip) => {
                session.status = ConversationStatus::AwaitingReply;
            }
            Some(ControlType::AnnounceSkip) | None => {}
        }

        let updated = session.clone();
        self.persist(&state).await?;
        Ok(updated)
    }

    pub async fn get(&self, key: &str) -> Option<ConversationSession> {
        self.state.lock().await.get(key).cloned()
    }

    /// §4.I janitor: active sessions past `expiresAt` become abandoned;
    /// completed/abandoned sessions older than 7 days are discarded.
    pub async fn run_janitor_pass(&self) -> Result<(usize, usize)> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let mut abandoned = 0;
        for session in state.values_mut() {
            if session.status == ConversationStatus::Active && session.expires_at < now {
                session.status = ConversationStatus::Abandoned;
                abandoned += 1;
            }
        }

        let discard_cutoff = now - Duration::days(DISCARD_AFTER_DAYS);
        let before = state.len();
        state.retain(|_, s| {
            !(matches!(s.status, ConversationStatus::Completed | ConversationStatus::Abandoned)
                && s.last_message_at < discard_cutoff)
        });
        let discarded = before - state.len();

        if abandoned > 0 || discarded > 0 {
            self.persist(&state).await?;
        }
        Ok((abandoned, discarded))
    }

    pub async fn run_janitor(
        registry: std::sync::Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(JANITOR_INTERVAL_SECS));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = registry.run_janitor_pass().await {
                        tracing::warn!(err = %e, "conversation session janitor pass failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn on_send_creates_session_with_key() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConversationRegistry::new(dir.path()).await.unwrap();
        let session = registry.on_send("cursor/dev", "replit/main", "thread-1", None).await.unwrap();
        assert_eq!(session.key, session_key("cursor/dev", "replit/main", "thread-1"));
        assert_eq!(session.message_count, 1);
    }

    #[tokio::test]
    async fn conversation_end_completes_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConversationRegistry::new(dir.path()).await.unwrap();
        let session = registry
            .on_send("cursor/dev", "replit/main", "thread-1", Some(ControlType::ConversationEnd))
            .await
            .unwrap();
        assert_eq!(session.status, ConversationStatus::Completed);
        assert!(session.completed_at.is_some());
    }

    #[tokio::test]
    async fn reply_skip_sets_awaiting_reply() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConversationRegistry::new(dir.path()).await.unwrap();
        let session = registry
            .on_send("cursor/dev", "replit/main", "thread-1", Some(ControlType::ReplySkip))
            .await
            .unwrap();
        assert_eq!(session.status, ConversationStatus::AwaitingReply);
    }

    #[tokio::test]
    async fn turn_swaps_when_sender_matches_current_turn() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConversationRegistry::new(dir.path()).await.unwrap();
        let first = registry.on_send("cursor/dev", "replit/main", "thread-1", None).await.unwrap();
        assert_eq!(first.current_turn, "replit/main");

        let second = registry.on_send("cursor/dev", "replit/main", "thread-1", None).await.unwrap();
        // sender no longer matches current_turn ("replit/main"), so no swap
        assert_eq!(second.current_turn, "replit/main");
        assert_eq!(second.turn_count, 1);
    }

    #[tokio::test]
    async fn janitor_abandons_expired_active_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConversationRegistry::new(dir.path()).await.unwrap();
        registry.on_send("cursor/dev", "replit/main", "thread-1", None).await.unwrap();

        {
            let mut state = registry.state.lock().await;
            for session in state.values_mut() {
                session.expires_at = Utc::now() - Duration::hours(1);
            }
        }

        let (abandoned, _) = registry.run_janitor_pass().await.unwrap();
        assert_eq!(abandoned, 1);
    }
}
