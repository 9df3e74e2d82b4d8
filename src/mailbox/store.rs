//! The mailbox store (§4.A): per-inbox ordered message lists with a
//! strict lifecycle state machine, TTL sweep, threading, and
//! write-through JSON persistence.
//!
//! The status machine follows `tasks/reducer.rs`'s pure
//! `reduce(state, event) -> Result<state>` pattern; the sweep loop shape
//! follows `tasks/janitor.rs`'s TTL janitor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use crate::archive::ArchiveStore;
use crate::audit::AuditLog;
use crate::registry::AgentRegistry;

use super::model::{
    expires_at_from, new_id, normalize_path, validate_path, ControlType, Message, Priority,
    SendRequest, Status,
};
use super::snapshot;

#[derive(Debug, Clone)]
pub enum MailboxEvent {
    Sent(Message),
    Approved(Message),
    StatusChanged { id: String, from: Status, to: Status },
    Deleted(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    messages: Vec<Message>,
}

#[derive(Default)]
struct State {
    messages: HashMap<String, Message>,
    /// Ordered message ids per inbox path — append order is the
    /// visibility order guaranteed by §5 "Ordering guarantees".
    inboxes: HashMap<String, Vec<String>>,
}

impl State {
    fn from_snapshot(snap: Snapshot) -> Self {
        let mut state = State::default();
        for message in snap.messages {
            state
                .inboxes
                .entry(message.to.clone())
                .or_default()
                .push(message.id.clone());
            state.messages.insert(message.id.clone(), message);
        }
        state
    }

    fn to_snapshot(&self) -> Snapshot {
        let mut messages: Vec<Message> = self.messages.values().cloned().collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Snapshot { messages }
    }

    fn insert(&mut self, message: Message) {
        self.inboxes
            .entry(message.to.clone())
            .or_default()
            .push(message.id.clone());
        self.messages.insert(message.id.clone(), message);
    }

    fn remove(&mut self, id: &str) -> Option<Message> {
        let message = self.messages.remove(id)?;
        if let Some(list) = self.inboxes.get_mut(&message.to) {
            list.retain(|m| m != id);
            if list.is_empty() {
                self.inboxes.remove(&message.to);
            }
        }
        Some(message)
    }
}

pub struct MailboxStore {
    state: Mutex<State>,
    snapshot_path: PathBuf,
    audit: AuditLog,
    archive: ArchiveStore,
    registry: AgentRegistry,
    events: broadcast::Sender<MailboxEvent>,
}

impl MailboxStore {
    pub async fn new(
        snapshot_path: PathBuf,
        audit: AuditLog,
        archive: ArchiveStore,
        registry: AgentRegistry,
    ) -> Result<Arc<Self>> {
        let snap: Snapshot = snapshot::read_or_default(&snapshot_path).await?;
        let state = State::from_snapshot(snap);
        let (tx, _) = broadcast::channel(256);

        Ok(Arc::new(Self {
            state: Mutex::new(state),
            snapshot_path,
            audit,
            archive,
            registry,
            events: tx,
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MailboxEvent> {
        self.events.subscribe()
    }

    async fn persist(&self, state: &State) -> Result<()> {
        snapshot::write_atomic(&self.snapshot_path, &state.to_snapshot()).await
    }

    pub fn validate_path(path: &str, has_project_metadata: bool) -> Result<Vec<String>> {
        validate_path(path, has_project_metadata)
    }

    /// §4.A "Send semantics".
    pub async fn send(&self, req: SendRequest) -> Result<Message> {
        let to = normalize_path(&req.to);
        let from = normalize_path(&req.from);
        let has_project_metadata = req.project.is_some() || req.project_name.is_some();
        validate_path(&to, has_project_metadata)?;

        let mut state = self.state.lock().await;

        let control_type = ControlType::detect(&req.task);
        let is_control_message = control_type.is_some();
        let thread_status = match control_type {
            Some(ControlType::ConversationEnd) => Some("completed".to_string()),
            _ => None,
        };

        let id = new_id();
        let now = Utc::now();

        let (thread_id, reply_to) = if let Some(parent_id) = &req.reply_to {
            let parent = state
                .messages
                .get(parent_id)
                .ok_or_else(|| anyhow!("replyTo target '{parent_id}' does not exist"))?
                .clone();
            let thread_id = parent.thread_id.clone();

            if let Some(parent_mut) = state.messages.get_mut(parent_id) {
                parent_mut.reply_count = Some(parent_mut.reply_count.unwrap_or(0) + 1);
                if parent_mut.status.is_actionable() {
                    parent_mut.status = Status::Completed;
                }
            }
            (thread_id, Some(parent_id.clone()))
        } else {
            (id.clone(), None)
        };

        drop(state);
        let auto_approve = if req.require_approval {
            false
        } else {
            self.registry.should_auto_approve(&from, &to).await?
        };
        let status = if auto_approve { Status::Approved } else { Status::Pending };

        let message = Message {
            id: id.clone(),
            to: to.clone(),
            from: from.clone(),
            timestamp: now,
            expires_at: expires_at_from(now),
            status,
            read_at: None,
            task: req.task,
            context: req.context,
            files: req.files,
            project_name: req.project_name,
            conversation_excerpt: req.conversation_excerpt,
            project: req.project,
            priority: req.priority.or(Some(Priority::default())),
            tags: req.tags,
            routing: req.routing,
            routed_at: Some(now),
            destination: req.destination,
            cowork_status: None,
            reply_to,
            thread_id,
            reply_count: None,
            is_control_message: Some(is_control_message),
            control_type,
            thread_status,
        };

        let mut state = self.state.lock().await;
        state.insert(message.clone());
        self.persist(&state).await?;
        drop(state);

        self.audit
            .record(
                "message.send",
                &message.from,
                "message",
                &message.id,
                Some(serde_json::json!({"to": message.to, "status": message.status})),
                None,
            )
            .await;
        let _ = self.events.send(MailboxEvent::Sent(message.clone()));

        if message.status == Status::Approved {
            self.audit
                .record(
                    "message.approve",
                    &message.from,
                    "message",
                    &message.id,
                    Some(serde_json::json!({"auto": true})),
                    None,
                )
                .await;
            let _ = self.events.send(MailboxEvent::Approved(message.clone()));
        }

        Ok(message)
    }

    /// §4.A "Check semantics".
    pub async fn check_inbox(
        &self,
        path: &str,
        include_terminal: bool,
        auto_approve_on_check: bool,
    ) -> Result<Vec<Message>> {
        let path = normalize_path(path);
        let mut state = self.state.lock().await;

        let ids = state.inboxes.get(&path).cloned().unwrap_or_default();
        let mut newly_approved: Vec<Message> = Vec::new();

        if auto_approve_on_check {
            for id in &ids {
                if let Some(message) = state.messages.get_mut(id) {
                    if message.status == Status::Pending {
                        message.status = Status::Approved;
                        newly_approved.push(message.clone());
                    }
                }
            }
        }

        if !newly_approved.is_empty() {
            self.persist(&state).await?;
        }

        let mut results: Vec<Message> = ids
            .iter()
            .filter_map(|id| state.messages.get(id).cloned())
            .filter(|m| include_terminal || m.status.is_actionable())
            .collect();
        results.sort_by_key(|m| m.timestamp);
        drop(state);

        // Route the transition through the same audit/event path every
        // other approval takes (§4.D "every lifecycle mutation... emits
        // exactly one audit entry") — `autoApproveOnCheck` is still a
        // write, not just a read, per §9's open question on conflating
        // the two.
        for message in &newly_approved {
            self.audit
                .record(
                    "message.approve",
                    &message.from,
                    "message",
                    &message.id,
                    Some(serde_json::json!({"auto": true})),
                    None,
                )
                .await;
            let _ = self.events.send(MailboxEvent::Approved(message.clone()));
        }

        Ok(results)
    }

    pub async fn get_message(&self, id: &str) -> Result<Message> {
        let state = self.state.lock().await;
        state
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("message '{id}' not found"))
    }

    pub async fn mark_read(&self, id: &str) -> Result<Message> {
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .get_mut(id)
            .ok_or_else(|| anyhow!("message '{id}' not found"))?;
        message.read_at = Some(Utc::now());
        message.status = Status::Read;
        let updated = message.clone();
        self.persist(&state).await?;
        Ok(updated)
    }

    /// `approve` additionally enforces source = pending (§4.A).
    pub async fn approve(&self, id: &str) -> Result<Message> {
        let message = self.update_status(id, Status::Approved).await.map_err(|e| {
            anyhow!("cannot approve message '{id}': {e}")
        })?;

        self.audit
            .record("message.approve", "operator", "message", id, None, None)
            .await;
        let _ = self.events.send(MailboxEvent::Approved(message.clone()));

        // §4.E/§2 "an in-band ping message is also appended to the
        // recipient's inbox as a wake-up" — the primary Auto-Wake
        // contract; the webhook POST (§4.F) is a richer, optional layer.
        let ping = SendRequest {
            to: message.to.clone(),
            from: "system/relay".to_string(),
            task: format!("🔔 PING: new approved message from {}", message.from),
            context: Some(format!("Approved message {} is ready.", message.id)),
            require_approval: false,
            ..Default::default()
        };
        if let Err(e) = self.send(ping).await {
            warn!(err = %e, message_id = %id, "failed to append ping wake-up message");
        }

        Ok(message)
    }

    pub async fn complete(&self, id: &str) -> Result<Message> {
        self.update_status(id, Status::Completed).await
    }

    /// Generic transition, validated against the §4.A status table.
    pub async fn update_status(&self, id: &str, target: Status) -> Result<Message> {
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .get_mut(id)
            .ok_or_else(|| anyhow!("message '{id}' not found"))?;

        let from = message.status;
        if !from.can_transition_to(target) {
            return Err(anyhow!(
                "illegal transition from {:?} to {:?} for message '{id}'",
                from,
                target
            ));
        }
        message.status = target;
        let updated = message.clone();
        self.persist(&state).await?;
        drop(state);

        self.audit
            .record(
                "message.status_update",
                "operator",
                "message",
                id,
                Some(serde_json::json!({"from": from, "to": target})),
                None,
            )
            .await;
        let _ = self.events.send(MailboxEvent::StatusChanged { id: id.to_string(), from, to: target });

        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .remove(id)
            .ok_or_else(|| anyhow!("message '{id}' not found"))?;
        self.persist(&state).await?;
        drop(state);

        self.audit
            .record("message.delete", "operator", "message", id, None, None)
            .await;
        let _ = self.events.send(MailboxEvent::Deleted(id.to_string()));
        Ok(())
    }

    /// §4.A "Threading": every message with `threadId == key or id ==
    /// key`, ordered by timestamp ascending.
    pub async fn get_thread(&self, thread_id: &str) -> Result<Vec<Message>> {
        let state = self.state.lock().await;
        let mut messages: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.thread_id == thread_id || m.id == thread_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(messages)
    }

    /// Groups by `threadId`, each ascending, ordered by the group's
    /// latest timestamp descending.
    pub async fn list_threads(&self) -> Result<Vec<Vec<Message>>> {
        let state = self.state.lock().await;
        let mut groups: HashMap<String, Vec<Message>> = HashMap::new();
        for message in state.messages.values() {
            groups.entry(message.thread_id.clone()).or_default().push(message.clone());
        }

        let mut threads: Vec<Vec<Message>> = groups.into_values().collect();
        for thread in &mut threads {
            thread.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        }
        threads.sort_by_key(|t| std::cmp::Reverse(t.last().map(|m| m.timestamp)));
        Ok(threads)
    }

    /// §4.A "TTL sweep". Archives completed threads before eviction;
    /// every other expired message gets a terminal `message.expire`
    /// audit entry (§10 supplement).
    pub async fn sweep(&self) -> Result<usize> {
        let mut state = self.state.lock().await;

        let mut completed_expiring_threads: Vec<String> = state
            .messages
            .values()
            .filter(|m| m.is_expired() && m.status == Status::Completed)
            .map(|m| m.thread_id.clone())
            .collect();
        completed_expiring_threads.sort();
        completed_expiring_threads.dedup();

        for thread_id in &completed_expiring_threads {
            let mut thread_messages: Vec<Message> = state
                .messages
                .values()
                .filter(|m| &m.thread_id == thread_id || &m.id == thread_id)
                .cloned()
                .collect();
            thread_messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

            if thread_messages.is_empty() {
                continue;
            }
            let mut participants: Vec<String> = thread_messages
                .iter()
                .flat_map(|m| [m.from.clone(), m.to.clone()])
                .collect();
            participants.sort();
            participants.dedup();

            let first_ts = thread_messages.first().unwrap().timestamp.to_rfc3339();
            let last_ts = thread_messages.last().unwrap().timestamp.to_rfc3339();
            let payload = serde_json::to_value(&thread_messages)?;

            if let Err(e) = self
                .archive
                .archive_thread(thread_id, &participants, &first_ts, &last_ts, payload, None)
                .await
            {
                warn!(err = %e, thread_id, "failed to archive thread during sweep");
            }
        }

        let expired_ids: Vec<String> = state
            .messages
            .values()
            .filter(|m| m.is_expired())
            .map(|m| m.id.clone())
            .collect();

        let mut swept = 0;
        for id in expired_ids {
            let Some(message) = state.remove(&id) else { continue };
            swept += 1;
            if !completed_expiring_threads.contains(&message.thread_id) {
                self.audit
                    .record("message.expire", "system", "message", &message.id, None, None)
                    .await;
            }
        }

        if swept > 0 {
            self.persist(&state).await?;
        }
        Ok(swept)
    }

    /// All messages currently held, any inbox, any status. Used by the
    /// dispatcher's poll loop (§4.E) and admin/metrics surfaces.
    pub async fn all_messages(&self) -> Vec<Message> {
        self.state.lock().await.messages.values().cloned().collect()
    }

    /// Clears in-memory inboxes and truncates the JSON snapshot. Does
    /// **not** touch audit or archive (§10 supplement) — for test
    /// harnesses and the `agents seed`-style CLI, not production use.
    pub async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = State::default();
        self.persist(&state).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Arc<MailboxStore> {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        for stmt in include_str!("../storage/migrations/001_init.sql").split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(&pool).await.unwrap();
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let snapshot_path = dir.path().join("mailbox.json");
        std::mem::forget(dir);

        let audit = AuditLog::new(pool.clone());
        let archive = ArchiveStore::new(pool.clone());
        let registry = AgentRegistry::new(pool);
        MailboxStore::new(snapshot_path, audit, archive, registry).await.unwrap()
    }

    fn send_req(from: &str, to: &str, task: &str) -> SendRequest {
        SendRequest {
            from: from.to_string(),
            to: to.to_string(),
            task: task.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn root_message_thread_id_is_its_own_id() {
        let store = store().await;
        let message = store.send(send_req("cursor/dev", "replit/main", "deploy")).await.unwrap();
        assert_eq!(message.thread_id, message.id);
    }

    #[tokio::test]
    async fn expires_at_is_exactly_48h_after_created_at() {
        let store = store().await;
        let message = store.send(send_req("cursor/dev", "replit/main", "deploy")).await.unwrap();
        assert_eq!(message.expires_at, message.timestamp + chrono::Duration::hours(48));
    }

    #[tokio::test]
    async fn unregistered_pair_auto_approves_on_send() {
        let store = store().await;
        let message = store.send(send_req("cursor/dev", "replit/main", "deploy")).await.unwrap();
        assert_eq!(message.status, Status::Approved);
    }

    #[tokio::test]
    async fn require_approval_forces_pending() {
        let store = store().await;
        let mut req = send_req("cursor/dev", "replit/main", "deploy");
        req.require_approval = true;
        let message = store.send(req).await.unwrap();
        assert_eq!(message.status, Status::Pending);
    }

    #[tokio::test]
    async fn reply_auto_completes_actionable_parent() {
        let store = store().await;
        let root = store.send(send_req("cursor/dev", "replit/main", "deploy")).await.unwrap();

        let mut reply_req = send_req("replit/main", "cursor/dev", "done");
        reply_req.reply_to = Some(root.id.clone());
        let reply = store.send(reply_req).await.unwrap();

        let parent = store.get_message(&root.id).await.unwrap();
        assert_eq!(parent.status, Status::Completed);
        assert_eq!(parent.reply_count, Some(1));
        assert_eq!(reply.thread_id, root.id);
    }

    #[tokio::test]
    async fn conversation_end_sets_thread_status() {
        let store = store().await;
        let message = store
            .send(send_req("cursor/dev", "replit/main", "CONVERSATION_END"))
            .await
            .unwrap();
        assert_eq!(message.is_control_message, Some(true));
        assert_eq!(message.thread_status.as_deref(), Some("completed"));
    }

    #[tokio::test]
    async fn check_inbox_excludes_terminal_by_default() {
        let store = store().await;
        let message = store.send(send_req("cursor/dev", "replit/main", "deploy")).await.unwrap();
        store.update_status(&message.id, Status::InProgress).await.unwrap();
        store.update_status(&message.id, Status::Completed).await.unwrap();

        let inbox = store.check_inbox("replit/main", false, false).await.unwrap();
        assert!(inbox.is_empty());

        let inbox_all = store.check_inbox("replit/main", true, false).await.unwrap();
        assert_eq!(inbox_all.len(), 1);
    }

    #[tokio::test]
    async fn auto_approve_on_check_clears_pending() {
        let store = store().await;
        let mut req = send_req("replit/dev", "claude/web", "review");
        req.require_approval = true;
        store.send(req).await.unwrap();

        let inbox = store.check_inbox("claude/web", false, true).await.unwrap();
        assert!(inbox.iter().all(|m| m.status != Status::Pending));
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let store = store().await;
        let message = store.send(send_req("cursor/dev", "replit/main", "deploy")).await.unwrap();
        let result = store.update_status(&message.id, Status::Completed).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn approve_requires_pending_source() {
        let store = store().await;
        let message = store.send(send_req("cursor/dev", "replit/main", "deploy")).await.unwrap();
        // already approved via auto-approval
        assert!(store.approve(&message.id).await.is_err());
    }

    #[tokio::test]
    async fn approve_appends_ping_wakeup_message() {
        let store = store().await;
        let mut req = send_req("replit/dev", "claude/web", "review");
        req.require_approval = true;
        let message = store.send(req).await.unwrap();

        store.approve(&message.id).await.unwrap();

        let inbox = store.check_inbox("claude/web", true, false).await.unwrap();
        assert!(inbox.iter().any(|m| m.task.starts_with("🔔 PING")));
    }

    #[tokio::test]
    async fn get_thread_orders_ascending_by_timestamp() {
        let store = store().await;
        let root = store.send(send_req("cursor/dev", "replit/main", "deploy")).await.unwrap();
        let mut reply_req = send_req("replit/main", "cursor/dev", "ack");
        reply_req.reply_to = Some(root.id.clone());
        store.send(reply_req).await.unwrap();

        let thread = store.get_thread(&root.id).await.unwrap();
        assert_eq!(thread.len(), 2);
        assert!(thread[0].timestamp <= thread[1].timestamp);
    }

    #[tokio::test]
    async fn path_validation_rejects_empty_segments() {
        assert!(MailboxStore::validate_path("claude//web", false).is_err());
    }

    #[tokio::test]
    async fn path_validation_allows_single_segment_with_project_metadata() {
        assert!(MailboxStore::validate_path("claude", true).is_ok());
        assert!(MailboxStore::validate_path("claude", false).is_err());
    }

    #[tokio::test]
    async fn delete_removes_message_and_empties_inbox() {
        let store = store().await;
        let message = store.send(send_req("cursor/dev", "replit/main", "deploy")).await.unwrap();
        store.delete(&message.id).await.unwrap();
        assert!(store.get_message(&message.id).await.is_err());
        assert!(store.check_inbox("replit/main", true, false).await.unwrap().is_empty());
    }
}
