//! Real-time Bridge (§4.G): a long-lived bidirectional session layer on
//! its own TCP listener, independent of the REST router. Grounded on the
//! teacher's `ipc/mod.rs` accept loop, rate limiters, and auth-challenge
//! pattern — adapted from JSON-RPC framing to the bridge's own frame
//! vocabulary (`auth`, `message`, `command`, `broadcast`, ...).

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::archive::ArchiveStore;
use crate::audit::AuditLog;
use crate::mailbox::{validate_path, MailboxStore, RoutingMode, SendRequest};
use crate::registry::AgentRegistry;
use crate::signature::{bridge_token, constant_time_eq};

const PROTOCOL_VERSION: u32 = 1;
const MAX_CONNECTIONS_PER_MIN: usize = 10;
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind_addr: String,
    pub shared_secret: Option<String>,
    pub dev_bypass: bool,
}

struct ConnectionRateLimiter {
    connections: HashMap<IpAddr, Vec<Instant>>,
}

impl ConnectionRateLimiter {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let one_min_ago = now - StdDuration::from_secs(60);
        let timestamps = self.connections.entry(ip).or_default();
        timestamps.retain(|t| *t > one_min_ago);
        if timestamps.len() >= MAX_CONNECTIONS_PER_MIN {
            return false;
        }
        timestamps.push(now);
        true
    }
}

struct AgentConnection {
    capabilities: Vec<String>,
    subscribed: HashSet<String>,
    sender: mpsc::UnboundedSender<WsMessage>,
}

#[derive(Default)]
struct ConnectionTable {
    connections: HashMap<String, AgentConnection>,
}

/// Shared bridge state plus the core modules it fronts.
pub struct Bridge {
    config: BridgeConfig,
    connections: Mutex<ConnectionTable>,
    mailbox: Arc<MailboxStore>,
    registry: AgentRegistry,
    audit: AuditLog,
    #[allow(dead_code)]
    archive: ArchiveStore,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        mailbox: Arc<MailboxStore>,
        registry: AgentRegistry,
        audit: AuditLog,
        archive: ArchiveStore,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            connections: Mutex::new(ConnectionTable::default()),
            mailbox,
            registry,
            audit,
            archive,
        })
    }

    pub fn validate_token(&self, agent_id: &str, token: &str) -> bool {
        if self.config.dev_bypass {
            return true;
        }
        let Some(secret) = &self.config.shared_secret else {
            return false;
        };
        let expected = bridge_token(secret, agent_id);
        constant_time_eq(&expected, token)
    }

    pub async fn is_online(&self, agent_id: &str) -> bool {
        self.connections.lock().await.connections.contains_key(agent_id)
    }

    pub async fn online_agents(&self) -> Vec<String> {
        self.connections.lock().await.connections.keys().cloned().collect()
    }

    pub async fn status(&self) -> Value {
        let online = self.online_agents().await;
        json!({"connected": !online.is_empty(), "onlineCount": online.len()})
    }

    pub async fn list_agents(&self, filter: Option<&Value>) -> Vec<Value> {
        let platform = filter.and_then(|f| f.get("platform")).and_then(Value::as_str);
        let capability = filter.and_then(|f| f.get("capability")).and_then(Value::as_str);

        let table = self.connections.lock().await;
        table
            .connections
            .iter()
            .filter(|(id, _)| platform.map(|p| id.starts_with(p)).unwrap_or(true))
            .filter(|(_, conn)| {
                capability.map(|c| conn.capabilities.iter().any(|cap| cap == c)).unwrap_or(true)
            })
            .map(|(id, conn)| json!({"agent_id": id, "online": true, "capabilities": conn.capabilities}))
            .collect()
    }

    async fn send_frame(&self, agent_id: &str, frame: Value) -> bool {
        let table = self.connections.lock().await;
        if let Some(conn) = table.connections.get(agent_id) {
            let text = frame.to_string();
            return conn.sender.send(WsMessage::Text(text)).is_ok();
        }
        false
    }

    async fn broadcast_presence(&self, agent_id: &str, online: bool) {
        let event = if online { "online" } else { "offline" };
        let frame = json!({"type": "presence", "agent_id": agent_id, "status": event});
        let table = self.connections.lock().await;
        for conn in table.connections.values() {
            let _ = conn.sender.send(WsMessage::Text(frame.to_string()));
        }
    }

    /// §4.G "Mailbox fallback (for offline recipients)".
    async fn mailbox_fallback(&self, from: &str, to: &str, content: &str) -> Result<()> {
        let to_norm = to.trim_start_matches('/').to_lowercase();
        let root = crate::mailbox::root_platform(&to_norm).to_string();

        let is_conversational = matches!(
            self.registry.get_by_platform(&root).await?,
            Some(agent) if agent.category == crate::registry::AgentCategory::Conversational
        );
        let has_sub_path = to_norm.contains('/');
        let destination = if is_conversational && has_sub_path { root } else { to_norm };

        validate_path(&destination, true)?;

        let mut tags = vec!["bridge".to_string(), "websocket".to_string(), "auto-approved".to_string()];
        tags.sort();

        let req = SendRequest {
            to: destination.clone(),
            from: from.to_string(),
            task: content.to_string(),
            tags: Some(tags),
            routing: RoutingMode::Direct,
            require_approval: false,
            ..Default::default()
        };
        let message = self.mailbox.send(req).await?;

        if message.status != crate::mailbox::Status::Approved {
            self.mailbox.approve(&message.id).await?;
        }

        self.audit
            .record(
                "message.approve",
                from,
                "message",
                &message.id,
                None,
                Some("quack-bridge"),
            )
            .await;
        Ok(())
    }

    /// One-shot HTTP relay: send then immediately approve (§4.G, same
    /// subsystem as `/bridge/connect`).
    pub async fn relay(
        &self,
        from: &str,
        to: &str,
        task: &str,
        context: Option<&str>,
        project: Option<&str>,
        priority: Option<crate::mailbox::Priority>,
        reply_to: Option<&str>,
    ) -> Result<Value> {
        let req = SendRequest {
            to: to.to_string(),
            from: from.to_string(),
            task: task.to_string(),
            context: context.map(str::to_string),
            project: project.map(str::to_string),
            priority,
            reply_to: reply_to.map(str::to_string),
            require_approval: false,
            ..Default::default()
        };
        let message = self.mailbox.send(req).await?;
        if message.status != crate::mailbox::Status::Approved {
            self.mailbox.approve(&message.id).await?;
        }

        self.audit
            .record(
                "bridge-relay",
                from,
                "message",
                &message.id,
                None,
                Some("bridge-relay"),
            )
            .await;

        Ok(json!({"success": true, "message_id": message.id, "status": "approved"}))
    }

    async fn handle_auth_frame(
        self: &Arc<Self>,
        frame: &Value,
    ) -> Result<(String, mpsc::UnboundedReceiver<WsMessage>)> {
        let agent_id = frame
            .get("agent_id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("auth frame missing agent_id"))?;
        if agent_id.split('/').count() != 2 || agent_id.contains("//") {
            return Err(anyhow!("agent_id must have shape platform/name"));
        }
        let token = frame.get("token").and_then(Value::as_str).unwrap_or("");
        if !self.validate_token(agent_id, token) {
            return Err(anyhow!("invalid bridge token"));
        }

        let capabilities: Vec<String> = frame
            .get("capabilities")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let (tx, rx) = mpsc::unbounded_channel();

        let replaced = {
            let mut table = self.connections.lock().await;
            let replaced = table.connections.remove(agent_id).is_some();
            table.connections.insert(
                agent_id.to_string(),
                AgentConnection {
                    capabilities,
                    subscribed: HashSet::new(),
                    sender: tx,
                },
            );
            replaced
        };

        if replaced {
            debug!(agent_id, "bridge connection replaced");
        }

        self.registry.update_last_activity(agent_id).await.ok();
        self.broadcast_presence(agent_id, true).await;
        Ok((agent_id.to_string(), rx))
    }

    async fn dispatch_frame(self: &Arc<Self>, agent_id: &str, frame: Value) -> Option<Value> {
        let frame_type = frame.get("type").and_then(Value::as_str).unwrap_or("");

        match frame_type {
            "ping" => {
                self.registry.update_last_activity(agent_id).await.ok();
                Some(json!({"type": "pong"}))
            }
            "message" => {
                let to = frame.get("to").and_then(Value::as_str).unwrap_or_default();
                let content = frame.get("content").and_then(Value::as_str).unwrap_or_default();
                if self.is_online(to).await {
                    let forwarded = json!({
                        "type": "message",
                        "from": agent_id,
                        "content": content,
                        "metadata": frame.get("metadata"),
                    });
                    self.send_frame(to, forwarded).await;
                    Some(json!({"type": "message_sent", "delivered": true}))
                } else {
                    match self.mailbox_fallback(agent_id, to, content).await {
                        Ok(()) => Some(json!({"type": "message_sent", "delivered": false})),
                        Err(e) => Some(json!({"type": "error", "message": e.to_string()})),
                    }
                }
            }
            "command" => {
                let to = frame.get("to").and_then(Value::as_str).unwrap_or_default();
                if self.is_online(to).await {
                    let command_id = frame
                        .get("command_id")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                    let forwarded = json!({
                        "type": "command",
                        "from": agent_id,
                        "action": frame.get("action"),
                        "payload": frame.get("payload"),
                        "command_id": command_id,
                    });
                    self.send_frame(to, forwarded).await;
                    Some(json!({"type": "command_sent", "command_id": command_id}))
                } else {
                    Some(json!({"type": "command_failed"}))
                }
            }
            "response" => {
                let to = frame.get("to").and_then(Value::as_str).unwrap_or_default();
                if self.is_online(to).await {
                    let forwarded = json!({
                        "type": "response",
                        "from": agent_id,
                        "command_id": frame.get("command_id"),
                        "result": frame.get("result"),
                        "error": frame.get("error"),
                    });
                    self.send_frame(to, forwarded).await;
                    None
                } else {
                    Some(json!({"type": "response_failed"}))
                }
            }
            "broadcast" => {
                let channel = frame.get("channel").and_then(Value::as_str).unwrap_or_default();
                let forwarded = json!({
                    "type": "broadcast",
                    "from": agent_id,
                    "channel": channel,
                    "content": frame.get("content"),
                });
                let table = self.connections.lock().await;
                for conn in table.connections.values() {
                    if conn.subscribed.contains(channel) {
                        let _ = conn.sender.send(WsMessage::Text(forwarded.to_string()));
                    }
                }
                None
            }
            "subscribe" => {
                let channels: Vec<String> = frame
                    .get("channels")
                    .and_then(Value::as_array)
                    .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                let mut table = self.connections.lock().await;
                if let Some(conn) = table.connections.get_mut(agent_id) {
                    conn.subscribed.extend(channels);
                }
                Some(json!({"type": "subscribed"}))
            }
            "list_agents" => {
                let agents = self.list_agents(frame.get("filter")).await;
                Some(json!({"type": "list_agents_result", "agents": agents}))
            }
            other => Some(json!({"type": "error", "message": format!("unknown frame type '{other}'")})),
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: tokio::net::TcpStream) -> Result<()> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws.split();

        write
            .send(WsMessage::Text(
                json!({"type": "welcome", "protocol_version": PROTOCOL_VERSION}).to_string(),
            ))
            .await?;

        let first = match read.next().await {
            Some(Ok(msg)) => msg,
            _ => return Ok(()),
        };
        let first_value: Value = match first {
            WsMessage::Text(text) => serde_json::from_str(&text)?,
            _ => return Err(anyhow!("expected text frame for auth")),
        };
        if first_value.get("type").and_then(Value::as_str) != Some("auth") {
            write
                .send(WsMessage::Text(json!({"type": "error", "message": "auth required"}).to_string()))
                .await
                .ok();
            return Ok(());
        }

        let (agent_id, mut outbox) = match self.handle_auth_frame(&first_value).await {
            Ok(pair) => pair,
            Err(e) => {
                write
                    .send(WsMessage::Text(json!({"type": "error", "message": e.to_string()}).to_string()))
                    .await
                    .ok();
                return Ok(());
            }
        };

        let online = self.online_agents().await;
        write
            .send(WsMessage::Text(
                json!({"type": "auth_success", "agent_id": agent_id, "online_agents": online}).to_string(),
            ))
            .await?;

        let outbound_task = tokio::spawn(async move {
            while let Some(msg) = outbox.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(msg)) = read.next().await {
            let WsMessage::Text(text) = msg else { continue };
            let Ok(frame): Result<Value, _> = serde_json::from_str(&text) else {
                self.send_frame(&agent_id, json!({"type": "error", "message": "bad JSON"})).await;
                continue;
            };
            if let Some(reply) = self.dispatch_frame(&agent_id, frame).await {
                self.send_frame(&agent_id, reply).await;
            }
        }

        outbound_task.abort();
        self.connections.lock().await.connections.remove(&agent_id);
        self.broadcast_presence(&agent_id, false).await;
        Ok(())
    }

    /// Accept loop — its own TCP listener, independent of the axum router.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!(addr = %self.config.bind_addr, "bridge listening");

        let conn_limiter = Arc::new(Mutex::new(ConnectionRateLimiter::new()));

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(c) => c,
                        Err(e) => {
                            warn!(err = %e, "bridge accept error");
                            continue;
                        }
                    };
                    {
                        let mut limiter = conn_limiter.lock().await;
                        if !limiter.check_and_record(peer.ip()) {
                            warn!(%peer, "bridge connection rate limit exceeded");
                            continue;
                        }
                    }
                    let bridge = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = bridge.handle_connection(stream).await {
                            warn!(%peer, err = %e, "bridge connection error");
                        }
                    });
                }
            }
        }

        info!("bridge stopped");
        Ok(())
    }

    /// §10 "Graceful shutdown": send every open connection a goodbye
    /// frame before the listener stops accepting new ones.
    pub async fn shutdown(&self) {
        let table = self.connections.lock().await;
        let frame = json!({"type": "goodbye", "reason": "server shutting down"}).to_string();
        for conn in table.connections.values() {
            let _ = conn.sender.send(WsMessage::Text(frame.clone()));
        }
    }

    /// 30s heartbeat sweep (§4.G): drop entries whose sender has no
    /// living receiver (the connection's read/write task already ended).
    pub async fn run_heartbeat_sweep(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(StdDuration::from_secs(HEARTBEAT_INTERVAL_SECS));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let mut table = self.connections.lock().await;
                    let dead: Vec<String> = table
                        .connections
                        .iter()
                        .filter(|(_, c)| c.sender.is_closed())
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in &dead {
                        table.connections.remove(id);
                    }
                    drop(table);
                    for id in dead {
                        self.broadcast_presence(&id, false).await;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelayQuery {
    pub from: String,
    pub to: String,
    pub task: String,
    pub context: Option<String>,
    pub project: Option<String>,
    pub priority: Option<String>,
    #[serde(rename = "replyTo")]
    pub reply_to: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bridge_for_tests(secret: Option<&str>, dev_bypass: bool) -> Arc<Bridge> {
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
        let mailbox = MailboxStore::new(snapshot_path, audit.clone(), archive.clone(), registry.clone())
            .await
            .unwrap();

        Bridge::new(
            BridgeConfig {
                bind_addr: "127.0.0.1:0".to_string(),
                shared_secret: secret.map(str::to_string),
                dev_bypass,
            },
            mailbox,
            registry,
            audit,
            archive,
        )
    }

    #[tokio::test]
    async fn dev_bypass_accepts_any_token() {
        let bridge = bridge_for_tests(None, true).await;
        assert!(bridge.validate_token("cursor/dev", "anything"));
    }

    #[tokio::test]
    async fn without_secret_or_bypass_token_is_rejected() {
        let bridge = bridge_for_tests(None, false).await;
        assert!(!bridge.validate_token("cursor/dev", "anything"));
    }

    #[tokio::test]
    async fn correct_hmac_token_is_accepted() {
        let bridge = bridge_for_tests(Some("shared-secret"), false).await;
        let token = bridge_token("shared-secret", "cursor/dev");
        assert!(bridge.validate_token("cursor/dev", &token));
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let bridge = bridge_for_tests(Some("shared-secret"), false).await;
        assert!(!bridge.validate_token("cursor/dev", "wrong"));
    }

    #[tokio::test]
    async fn relay_sends_and_approves() {
        let bridge = bridge_for_tests(None, true).await;
        let result = bridge
            .relay("cursor/dev", "replit/main", "deploy", None, None, None, None)
            .await
            .unwrap();
        assert_eq!(result["status"], "approved");
    }

    #[tokio::test]
    async fn status_reports_no_connections_initially() {
        let bridge = bridge_for_tests(None, true).await;
        let status = bridge.status().await;
        assert_eq!(status["onlineCount"], 0);
    }
}
