//! Webhook fan-out (§4.F): per-inbox subscriber list, delivered on send
//! and on approval, plus an independent Auto-Wake POST straight to a
//! registered agent webhook URL.
//!
//! Follows `telemetry/mod.rs`'s background-sender shape (never block
//! the caller; best-effort HTTP, failures logged/counted).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::mailbox::{snapshot, MailboxEvent, MailboxStore, Message};
use crate::registry::AgentRegistry;
use crate::signature::sign_webhook_body;

const AUTO_WAKE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    pub id: String,
    pub inbox: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SubscriberFile {
    subscribers: Vec<Subscriber>,
}

pub struct WebhookStore {
    path: PathBuf,
    state: Mutex<HashMap<String, Subscriber>>,
    client: reqwest::Client,
}

impl WebhookStore {
    pub async fn new(data_dir: &std::path::Path) -> Result<Self> {
        let path = data_dir.join("webhooks.json");
        let file: SubscriberFile = snapshot::read_or_default(&path).await?;
        let state = file.subscribers.into_iter().map(|s| (s.id.clone(), s)).collect();
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(AUTO_WAKE_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            path,
            state: Mutex::new(state),
            client,
        })
    }

    async fn persist(&self, state: &HashMap<String, Subscriber>) -> Result<()> {
        let file = SubscriberFile {
            subscribers: state.values().cloned().collect(),
        };
        snapshot::write_atomic(&self.path, &file).await
    }

    pub async fn subscribe(&self, inbox: &str, url: String, secret: Option<String>) -> Result<Subscriber> {
        let subscriber = Subscriber {
            id: Uuid::new_v4().to_string(),
            inbox: inbox.to_string(),
            url,
            secret,
            failure_count: 0,
            last_failure_at: None,
            created_at: Utc::now(),
        };

        let mut state = self.state.lock().await;
        state.insert(subscriber.id.clone(), subscriber.clone());
        self.persist(&state).await?;
        Ok(subscriber)
    }

    pub async fn list(&self) -> Vec<Subscriber> {
        self.state.lock().await.values().cloned().collect()
    }

    pub async fn unsubscribe(&self, id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let removed = state.remove(id).is_some();
        if removed {
            self.persist(&state).await?;
        }
        Ok(removed)
    }

    async fn subscribers_for(&self, inbox: &str) -> Vec<Subscriber> {
        self.state
            .lock()
            .await
            .values()
            .filter(|s| s.inbox == inbox)
            .cloned()
            .collect()
    }

    async fn record_failure(&self, id: &str) {
        let mut state = self.state.lock().await;
        if let Some(sub) = state.get_mut(id) {
            sub.failure_count += 1;
            sub.last_failure_at = Some(Utc::now());
        }
        let _ = self.persist(&state).await;
    }

    /// Deliver `event_type` to every subscriber of `message.to`. Never
    /// unsubscribes on failure (§4.F) — just counts it.
    async fn notify_subscribers(&self, event_type: &str, message: &Message) {
        let subs = self.subscribers_for(&message.to).await;
        if subs.is_empty() {
            return;
        }

        let body = serde_json::json!({
            "event": event_type,
            "inbox": message.to,
            "message": message,
        });
        let Ok(raw_body) = serde_json::to_vec(&body) else { return };

        for sub in subs {
            let mut request = self.client.post(&sub.url).body(raw_body.clone());
            if let Some(secret) = &sub.secret {
                let signature = sign_webhook_body(secret, &raw_body);
                request = request.header("X-Quack-Signature", signature);
            }

            match request.send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    warn!(inbox = %sub.inbox, status = %resp.status(), "webhook delivery rejected");
                    self.record_failure(&sub.id).await;
                }
                Err(e) => {
                    warn!(inbox = %sub.inbox, err = %e, "webhook delivery failed");
                    self.record_failure(&sub.id).await;
                }
            }
        }
    }

    /// §4.F "Auto-Wake": independent of subscribers, POST straight to
    /// the destination agent's registered webhook URL, best-effort.
    async fn auto_wake(&self, registry: &AgentRegistry, message: &Message) {
        let root = crate::mailbox::root_platform(&message.to);
        let Ok(Some(agent)) = registry.get_by_platform(root).await else { return };
        let Some(url) = &agent.webhook_url else { return };

        let task_excerpt: String = message.task.chars().take(200).collect();
        let body: Value = serde_json::json!({
            "event": "new_message",
            "inbox": message.to,
            "from": message.from,
            "messageId": message.id,
            "task": task_excerpt,
            "timestamp": message.timestamp,
        });
        let Ok(raw_body) = serde_json::to_vec(&body) else { return };

        let mut request = self.client.post(url).body(raw_body.clone());
        if let Some(secret) = &agent.webhook_secret {
            request = request.header("X-Quack-Signature", sign_webhook_body(secret, &raw_body));
        }

        if let Err(e) = request.send().await {
            warn!(agent = %agent.id, err = %e, "Auto-Wake POST failed");
        }
    }

    /// Spawns the background task that reacts to mailbox send/approve
    /// events for as long as the returned handle is kept alive.
    pub fn spawn(
        self: &Arc<Self>,
        mailbox: &Arc<MailboxStore>,
        registry: AgentRegistry,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let mut events = mailbox.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(MailboxEvent::Sent(message)) => {
                        store.notify_subscribers("message.received", &message).await;
                        store.auto_wake(&registry, &message).await;
                    }
                    Ok(MailboxEvent::Approved(message)) => {
                        store.notify_subscribers("message.approved", &message).await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_then_list_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = WebhookStore::new(dir.path()).await.unwrap();
        store
            .subscribe("claude/web", "https://example.com/hook".to_string(), None)
            .await
            .unwrap();

        let subs = store.list().await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].inbox, "claude/web");
    }

    #[tokio::test]
    async fn unsubscribe_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = WebhookStore::new(dir.path()).await.unwrap();
        let sub = store
            .subscribe("claude/web", "https://example.com/hook".to_string(), None)
            .await
            .unwrap();

        assert!(store.unsubscribe(&sub.id).await.unwrap());
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn subscribers_for_filters_by_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let store = WebhookStore::new(dir.path()).await.unwrap();
        store.subscribe("claude/web", "https://a".to_string(), None).await.unwrap();
        store.subscribe("replit/main", "https://b".to_string(), None).await.unwrap();

        let subs = store.subscribers_for("claude/web").await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].url, "https://a");
    }
}
