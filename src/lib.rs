//! Agent Relay Core: a multi-protocol mailbox server letting autonomous
//! and conversational agents exchange work items, hold turn-based
//! conversations, and talk over a real-time bridge.
//!
//! `AppContext` wires every durable/cached store together; `main.rs`
//! builds one and hands it to the REST router, the bridge listener, and
//! the background loops (dispatcher, TTL sweep, conversation janitor).

pub mod archive;
pub mod audit;
pub mod blobs;
pub mod bridge;
pub mod config;
pub mod convsession;
pub mod dispatcher;
pub mod keys;
pub mod mailbox;
pub mod recorder;
pub mod registry;
pub mod rest;
pub mod signature;
pub mod storage;
pub mod toolserver;
pub mod webhooks;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use archive::ArchiveStore;
use audit::AuditLog;
use blobs::BlobStore;
use bridge::{Bridge, BridgeConfig};
use config::DaemonConfig;
use convsession::ConversationRegistry;
use dispatcher::Dispatcher;
use keys::KeyStore;
use mailbox::MailboxStore;
use recorder::FlightRecorder;
use registry::AgentRegistry;
use storage::Storage;
use webhooks::WebhookStore;

/// Everything the daemon needs once it's up: durable SQL-backed stores,
/// JSON-snapshot caches, and the background-task handles that keep them
/// moving. Held behind `Arc` and cloned into every request handler.
pub struct AppContext {
    pub config: DaemonConfig,
    pub started_at: DateTime<Utc>,

    pub mailbox: Arc<MailboxStore>,
    pub registry: AgentRegistry,
    pub blobs: Arc<BlobStore>,
    pub audit: AuditLog,
    pub archive: ArchiveStore,
    pub webhooks: Arc<WebhookStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub bridge: Arc<Bridge>,
    pub recorder: FlightRecorder,
    pub conversations: Arc<ConversationRegistry>,
    pub keys: KeyStore,
}

impl AppContext {
    pub async fn new(config: DaemonConfig) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let storage = Storage::new(&config.data_dir).await?;
        let pool = storage.pool().clone();

        let audit = AuditLog::new(pool.clone());
        let archive = ArchiveStore::new(pool.clone());
        let registry = AgentRegistry::new(pool.clone());
        let keys = KeyStore::new(pool.clone());
        let recorder = FlightRecorder::new(pool.clone());
        registry.seed_defaults().await?;

        let mailbox_snapshot_path: PathBuf = config.data_dir.join("mailbox.json");
        let mailbox = MailboxStore::new(
            mailbox_snapshot_path,
            audit.clone(),
            archive.clone(),
            registry.clone(),
        )
        .await?;

        let blobs = Arc::new(BlobStore::new(&config.data_dir).await?);
        let webhooks = Arc::new(WebhookStore::new(&config.data_dir).await?);
        let conversations = Arc::new(ConversationRegistry::new(&config.data_dir).await?);

        let dispatcher = Dispatcher::new(
            Arc::clone(&mailbox),
            registry.clone(),
            audit.clone(),
            config.dispatch_poll_interval,
        )?;

        let bridge = Bridge::new(
            BridgeConfig {
                bind_addr: format!("0.0.0.0:{}", config.bridge_port),
                shared_secret: config.bridge_shared_secret.clone(),
                dev_bypass: config.dev_bypass,
            },
            Arc::clone(&mailbox),
            registry.clone(),
            audit.clone(),
            archive.clone(),
        );

        Ok(Arc::new(Self {
            config,
            started_at: Utc::now(),
            mailbox,
            registry,
            blobs,
            audit,
            archive,
            webhooks,
            dispatcher,
            bridge,
            recorder,
            conversations,
            keys,
        }))
    }

    /// Spawns every background loop (dispatcher poll, TTL sweep, blob
    /// sweep, conversation janitor, webhook fan-out, bridge heartbeat)
    /// and returns once `shutdown` is signalled and they've all wound
    /// down.
    pub async fn run_background_tasks(self: &Arc<Self>, shutdown: tokio::sync::watch::Receiver<bool>) {
        let webhook_task = self.webhooks.spawn(&self.mailbox, self.registry.clone());

        let dispatcher_task = tokio::spawn(Dispatcher::run(Arc::clone(&self.dispatcher), shutdown.clone()));
        let janitor_task = tokio::spawn(ConversationRegistry::run_janitor(
            Arc::clone(&self.conversations),
            shutdown.clone(),
        ));
        let heartbeat_task = tokio::spawn(Bridge::run_heartbeat_sweep(
            Arc::clone(&self.bridge),
            shutdown.clone(),
        ));
        let sweep_task = tokio::spawn(run_ttl_sweep_loop(
            Arc::clone(&self.mailbox),
            self.config.ttl_sweep_interval,
            shutdown.clone(),
        ));
        let blob_sweep_task = tokio::spawn(run_blob_sweep_loop(
            Arc::clone(&self.blobs),
            self.config.blob_sweep_interval,
            shutdown.clone(),
        ));

        let _ = tokio::join!(
            dispatcher_task,
            janitor_task,
            heartbeat_task,
            sweep_task,
            blob_sweep_task,
        );
        webhook_task.abort();
    }
}

async fn run_ttl_sweep_loop(
    mailbox: Arc<MailboxStore>,
    interval: StdDuration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = mailbox.sweep().await {
                    tracing::warn!(err = %e, "mailbox TTL sweep failed");
                }
            }
        }
    }
}

async fn run_blob_sweep_loop(
    blobs: Arc<BlobStore>,
    interval: StdDuration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = blobs.sweep().await {
                    tracing::warn!(err = %e, "blob sweep failed");
                }
            }
        }
    }
}
