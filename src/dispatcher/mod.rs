//! Dispatcher (§4.E): polls for approved messages destined to webhook
//! agents and pushes the work payload to their registered base URL.
//!
//! Follows `telemetry/mod.rs`'s spawn/flush loop shape and
//! `tasks/janitor.rs`'s interval-driven background task.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::mailbox::{root_platform, MailboxStore, Message, Status};
use crate::registry::{AgentRegistry, NotificationMode};

const DISPATCH_TIMEOUT_SECS: u64 = 10;

pub struct Dispatcher {
    mailbox: Arc<MailboxStore>,
    registry: AgentRegistry,
    audit: AuditLog,
    client: reqwest::Client,
    in_flight: Mutex<HashSet<String>>,
    poll_interval: StdDuration,
}

impl Dispatcher {
    pub fn new(
        mailbox: Arc<MailboxStore>,
        registry: AgentRegistry,
        audit: AuditLog,
        poll_interval: StdDuration,
    ) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(DISPATCH_TIMEOUT_SECS))
            .build()?;

        Ok(Arc::new(Self {
            mailbox,
            registry,
            audit,
            client,
            in_flight: Mutex::new(HashSet::new()),
            poll_interval,
        }))
    }

    /// §4.E step 1-5 for a single message, assuming it is currently
    /// `approved` and its destination is a registered webhook agent.
    async fn dispatch_one(&self, message: Message, base_url: &str) {
        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(message.id.clone()) {
                return;
            }
        }

        if let Err(e) = self.mailbox.update_status(&message.id, Status::InProgress).await {
            warn!(message_id = %message.id, err = %e, "dispatcher failed to mark message in-progress");
            self.in_flight.lock().await.remove(&message.id);
            return;
        }

        let payload = json!({
            "messageId": message.id,
            "task": message.task,
            "context": message.context,
            "from": message.from,
            "to": message.to,
            "files": message.files,
            "timestamp": message.timestamp,
        });

        let url = format!("{}/api/task", base_url.trim_end_matches('/'));
        match self.client.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(message_id = %message.id, %url, "dispatched message");
            }
            Ok(resp) => {
                warn!(message_id = %message.id, status = %resp.status(), %url, "dispatch rejected");
            }
            Err(e) => {
                warn!(message_id = %message.id, err = %e, %url, "dispatch request failed");
            }
        }
        // §4.E step 4: on failure we do not revert status — the receiver
        // is expected to report completion via `updateStatus` eventually.

        self.audit
            .record(
                "dispatcher.attempt",
                "dispatcher",
                "message",
                &message.id,
                Some(json!({"url": url})),
                None,
            )
            .await;

        self.in_flight.lock().await.remove(&message.id);
    }

    async fn webhook_base_url(&self, to: &str) -> Option<String> {
        let root = root_platform(to);
        let agent = self.registry.get_by_platform(root).await.ok().flatten()?;
        if agent.notification_mode != NotificationMode::Webhook {
            return None;
        }
        agent.platform_url
    }

    /// One poll cycle: scan all inboxes for `approved` messages whose
    /// destination is a webhook agent.
    async fn poll_once(&self) {
        for message in self.mailbox.all_messages().await {
            if message.status != Status::Approved {
                continue;
            }
            if self.in_flight.lock().await.contains(&message.id) {
                continue;
            }
            if let Some(base_url) = self.webhook_base_url(&message.to).await {
                self.dispatch_one(message, &base_url).await;
            }
        }
    }

    /// §4.E `dispatchNow(id)`: dispatch a single message immediately if
    /// it is currently `approved`, outside the normal poll cadence.
    pub async fn dispatch_now(&self, id: &str) -> Result<()> {
        let message = self.mailbox.get_message(id).await?;
        if message.status != Status::Approved {
            return Err(anyhow::anyhow!("message '{id}' is not approved"));
        }
        if let Some(base_url) = self.webhook_base_url(&message.to).await {
            self.dispatch_one(message, &base_url).await;
        }
        Ok(())
    }

    /// Runs forever on `poll_interval` until `shutdown` resolves.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveStore;
    use crate::mailbox::SendRequest;
    use crate::registry::AgentSpec;

    async fn setup() -> (Arc<Dispatcher>, Arc<MailboxStore>, AgentRegistry) {
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
        let registry = AgentRegistry::new(pool.clone());
        let mailbox = MailboxStore::new(snapshot_path, audit.clone(), archive, registry.clone())
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(mailbox.clone(), registry.clone(), audit, StdDuration::from_secs(5)).unwrap();
        (dispatcher, mailbox, registry)
    }

    #[tokio::test]
    async fn dispatch_now_rejects_non_approved_message() {
        let (dispatcher, mailbox, _registry) = setup().await;
        let mut req = SendRequest {
            from: "replit/dev".to_string(),
            to: "claude/web".to_string(),
            task: "review".to_string(),
            ..Default::default()
        };
        req.require_approval = true;
        let message = mailbox.send(req).await.unwrap();

        assert!(dispatcher.dispatch_now(&message.id).await.is_err());
    }

    #[tokio::test]
    async fn webhook_base_url_none_without_webhook_mode() {
        let (dispatcher, _mailbox, registry) = setup().await;
        registry
            .upsert("replit", "main", AgentSpec::default())
            .await
            .unwrap();
        assert!(dispatcher.webhook_base_url("replit/main").await.is_none());
    }
}
