mod api;
mod gateway;
mod webhook;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wagate_core::clock::{SharedClock, SystemClock};
use wagate_core::config::{self, Config, GatewayConfig};
use wagate_core::shellexpand;
use wagate_store::SessionRepository;
use wagate_whatsapp::SqlxDeviceContainer;

#[derive(Parser)]
#[command(
    name = "wagate",
    version,
    about = "wagate: multi-tenant WhatsApp session gateway"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, env = "WAGATE_CONFIG", default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway and, if enabled, the HTTP API.
    Start,
    /// Show configuration and session counts.
    Status,
    /// List stored sessions.
    Sessions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(&cli.config)?;
    let _log_guard = init_tracing(&cfg.gateway)?;

    match cli.command {
        Commands::Start => start(cfg).await?,
        Commands::Status => status(&cli.config, &cfg).await?,
        Commands::Sessions => sessions(&cfg).await?,
    }

    Ok(())
}

/// Stderr logging always; a daily rolling file too when `log_file` is set.
/// The returned guard flushes the file writer on drop.
fn init_tracing(cfg: &GatewayConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));

    let (file_layer, guard) = match cfg.log_file {
        Some(ref path) => {
            let path = PathBuf::from(shellexpand(path));
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "wagate.log".to_string());
            std::fs::create_dir_all(&dir)?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn start(cfg: Config) -> anyhow::Result<()> {
    let clock: SharedClock = Arc::new(SystemClock);
    let repo = SessionRepository::new(&cfg.store, clock.clone()).await?;
    let container = SqlxDeviceContainer::new(&cfg.whatsapp).await?;

    let (webhooks, webhook_worker) = if cfg.webhook.enabled {
        let sink = Arc::new(webhook::HttpWebhookSink::new(&cfg.webhook)?);
        let (queue, worker) =
            webhook::spawn_worker(&cfg.webhook, sink, cfg.runtime.webhook_buffer);
        info!("webhooks enabled for {} url(s)", cfg.webhook.urls.len());
        (Some(queue), Some(worker))
    } else {
        (None, None)
    };

    println!("wagate: starting gateway...");
    let gw = gateway::Gateway::new(
        repo,
        Arc::new(container),
        clock,
        cfg.runtime.clone(),
        cfg.whatsapp.print_qr,
        webhooks,
    );
    let sweeper = gw.run().await?;

    let api_shutdown = CancellationToken::new();
    let api_task = if cfg.api.enabled {
        let api_cfg = cfg.api.clone();
        let gw = gw.clone();
        let token = api_shutdown.clone();
        Some(tokio::spawn(
            async move { api::serve(&api_cfg, gw, token).await },
        ))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    api_shutdown.cancel();
    if let Some(task) = api_task {
        let _ = task.await;
    }
    gw.shutdown().await;
    let _ = sweeper.await;
    drop(gw);

    if let Some(worker) = webhook_worker {
        let grace = Duration::from_secs(cfg.webhook.timeout_secs.saturating_add(1));
        if tokio::time::timeout(grace, worker).await.is_err() {
            warn!("webhook worker did not drain within {}s", grace.as_secs());
        }
    }

    info!("wagate stopped");
    Ok(())
}

async fn status(path: &str, cfg: &Config) -> anyhow::Result<()> {
    println!("wagate status\n");
    println!("Config: {path}");
    println!("Session store: {}", shellexpand(&cfg.store.db_path));
    println!("Device store: {}", shellexpand(&cfg.whatsapp.device_db_path));
    println!();

    println!(
        "  api: {}",
        if cfg.api.enabled {
            format!("http://{}:{}", cfg.api.host, cfg.api.port)
        } else {
            "disabled".to_string()
        }
    );
    println!(
        "  webhooks: {}",
        if cfg.webhook.enabled {
            format!("{} url(s)", cfg.webhook.urls.len())
        } else {
            "disabled".to_string()
        }
    );

    let repo = SessionRepository::new(&cfg.store, Arc::new(SystemClock)).await?;
    let total = repo.count().await?;
    let connected = repo.count_connected().await?;
    println!();
    println!(
        "  sessions: {total} total, {connected} marked connected, {} offline",
        total - connected
    );
    Ok(())
}

async fn sessions(cfg: &Config) -> anyhow::Result<()> {
    let repo = SessionRepository::new(&cfg.store, Arc::new(SystemClock)).await?;
    let sessions = repo.list_all().await?;
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }

    let now = chrono::Utc::now();
    println!("{:<36}  {:<24}  {:<12}  DEVICE", "ID", "NAME", "STATUS");
    for s in sessions {
        println!(
            "{:<36}  {:<24}  {:<12}  {}",
            s.id,
            s.name,
            s.status_at(now).as_str(),
            s.device_jid.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
