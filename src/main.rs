use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use agentrelay::config::DaemonConfig;
use agentrelay::AppContext;

#[derive(Parser)]
#[command(name = "agentrelay", about = "Agent Relay Core — multi-protocol mailbox server", version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// REST server port
    #[arg(long, env = "AGENTRELAY_REST_PORT")]
    rest_port: Option<u16>,

    /// Real-time bridge TCP listener port
    #[arg(long, env = "AGENTRELAY_BRIDGE_PORT")]
    bridge_port: Option<u16>,

    /// Data directory for the SQLite database and JSON snapshots
    #[arg(long, env = "AGENTRELAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "AGENTRELAY_LOG")]
    log: Option<String>,

    /// Shared secret used to derive bridge auth tokens
    #[arg(long, env = "AGENTRELAY_BRIDGE_SECRET")]
    bridge_secret: Option<String>,

    /// Accept any bridge token / API key and grant admin. Development only.
    #[arg(long)]
    dev_bypass: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST server, the real-time bridge, and all background
    /// loops in the foreground. Default when no subcommand is given.
    Serve,
    /// API key management.
    Keys {
        #[command(subcommand)]
        action: KeysCommand,
    },
    /// Agent registry management.
    Agents {
        #[command(subcommand)]
        action: AgentsCommand,
    },
}

#[derive(Subcommand)]
enum KeysCommand {
    /// Create a new API key. The plaintext key is printed once.
    Create {
        #[arg(long)]
        owner: String,
        #[arg(long, value_delimiter = ',')]
        permissions: Vec<String>,
    },
    /// List all API keys (hashes only — plaintext is never stored).
    List,
    /// Revoke an API key by id.
    Revoke {
        id: String,
    },
}

#[derive(Subcommand)]
enum AgentsCommand {
    /// (Re-)seed the built-in default agents (claude, gpt, gemini, grok,
    /// copilot, replit, cursor, antigravity). Idempotent.
    Seed,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = DaemonConfig::new(
        args.rest_port,
        args.bridge_port,
        args.data_dir,
        args.log.clone(),
        args.bridge_secret,
        args.dev_bypass,
    );

    init_tracing(&config.log);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Keys { action } => run_keys_command(config, action).await,
        Command::Agents { action } => run_agents_command(config, action).await,
    }
}

fn init_tracing(log: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(log).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve(config: DaemonConfig) -> Result<()> {
    let ctx = AppContext::new(config).await.context("failed to initialize daemon state")?;
    info!(rest_port = ctx.config.rest_port, bridge_port = ctx.config.bridge_port, "starting agentrelay");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let router = agentrelay::rest::router(Arc::clone(&ctx));
    let rest_addr = format!("0.0.0.0:{}", ctx.config.rest_port);
    let listener = tokio::net::TcpListener::bind(&rest_addr)
        .await
        .with_context(|| format!("failed to bind REST listener on {rest_addr}"))?;

    let rest_shutdown = shutdown_rx.clone();
    let rest_task = tokio::spawn(async move {
        let mut shutdown = rest_shutdown;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
    });

    let bridge = Arc::clone(&ctx.bridge);
    let bridge_shutdown = shutdown_rx.clone();
    let bridge_task = tokio::spawn(async move {
        if let Err(e) = bridge.run(bridge_shutdown).await {
            warn!(err = %e, "bridge listener exited with error");
        }
    });

    let background_ctx = Arc::clone(&ctx);
    let background_shutdown = shutdown_rx.clone();
    let background_task = tokio::spawn(async move {
        background_ctx.run_background_tasks(background_shutdown).await;
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping daemon");
    ctx.bridge.shutdown().await;
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(rest_task, bridge_task, background_task);
    info!("agentrelay stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run_keys_command(config: DaemonConfig, action: KeysCommand) -> Result<()> {
    let ctx = AppContext::new(config).await?;
    match action {
        KeysCommand::Create { owner, permissions } => {
            let created = ctx.keys.create(&owner, permissions).await?;
            println!("id:        {}", created.key.id);
            println!("plaintext: {}", created.plaintext);
            println!("(the plaintext key will not be shown again)");
        }
        KeysCommand::List => {
            for key in ctx.keys.list().await? {
                println!(
                    "{}  owner={}  revoked={}  permissions={:?}",
                    key.id, key.owner, key.revoked, key.permissions
                );
            }
        }
        KeysCommand::Revoke { id } => {
            if ctx.keys.revoke(&id).await? {
                println!("revoked {id}");
            } else {
                println!("no such key: {id}");
            }
        }
    }
    Ok(())
}

async fn run_agents_command(config: DaemonConfig, action: AgentsCommand) -> Result<()> {
    let ctx = AppContext::new(config).await?;
    match action {
        AgentsCommand::Seed => {
            ctx.registry.seed_defaults().await?;
            for agent in ctx.registry.list().await? {
                println!("{} ({:?})", agent.id, agent.category);
            }
        }
    }
    Ok(())
}
