//! # SchoolCast — bulk WhatsApp notifications for schools
//!
//! Sends pending notifications in throttled batches and keeps an eye on the
//! WhatsApp instances used to send them.
//!
//! Usage:
//!   schoolcast send --filter grade-7               # Send pending notifications
//!   schoolcast send --filter all --offset 40       # Resume from a cursor
//!   schoolcast watch wa-1 wa-2                     # Report connect/disconnect
//!   schoolcast init                                # Write default config

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use schoolcast_channels::{ConnectionEvent, ConnectionPoller, ProviderClient};
use schoolcast_core::traits::NotificationSink;
use schoolcast_core::types::{BatchProgress, DispatchParams, Offset};
use schoolcast_core::{SchoolCastConfig, SchoolCastError};
use schoolcast_scheduler::{BackoffScheduler, DispatchController, FanoutSink, NotificationLog, WebhookSink};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// How long to wait for webhook deliveries before exiting.
const WEBHOOK_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(
    name = "schoolcast",
    version,
    about = "📣 SchoolCast — rate-limited bulk WhatsApp notifications"
)]
struct Cli {
    /// Config file (default: ~/.schoolcast/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send all pending notifications matching a filter
    Send {
        /// Recipient filter understood by the backend (class, grade, "all")
        #[arg(short, long)]
        filter: String,

        /// Also send to recipients that already received this notification
        #[arg(long)]
        include_sent: bool,

        /// Resume from a cursor returned by an earlier run
        #[arg(long)]
        offset: Option<String>,
    },
    /// Watch WhatsApp instances and report connection changes
    Watch {
        /// Instance ids (default: poller.instances from config)
        ids: Vec<String>,
    },
    /// Write the default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "schoolcast=debug,schoolcast_scheduler=debug,schoolcast_channels=debug"
    } else {
        "schoolcast=info,schoolcast_scheduler=info,schoolcast_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config_path = cli.config.as_deref().map(expand_path);

    if let Commands::Init { force } = &cli.command {
        let path = config_path.unwrap_or_else(SchoolCastConfig::default_path);
        return init_config(&path, *force);
    }

    let config = match &config_path {
        Some(path) => SchoolCastConfig::load_from(path)?,
        None => SchoolCastConfig::load()?,
    };
    config.validate()?;

    match cli.command {
        Commands::Send {
            filter,
            include_sent,
            offset,
        } => run_send(&config, filter, include_sent, offset).await,
        Commands::Watch { ids } => run_watch(&config, ids).await,
        Commands::Init { .. } => Ok(()),
    }
}

fn init_config(path: &std::path::Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("⚠️  Config already exists: {} (use --force to overwrite)", path.display());
        return Ok(());
    }
    SchoolCastConfig::default().save_to(path)?;
    println!("✅ Config written: {}", path.display());
    Ok(())
}

/// Notification sinks for one command. The webhook is kept apart so its
/// pending deliveries can be flushed before the runtime goes away.
struct Sinks {
    all: Arc<dyn NotificationSink>,
    webhook: Option<Arc<WebhookSink>>,
}

impl Sinks {
    fn from_config(config: &SchoolCastConfig) -> Self {
        let mut all = FanoutSink::new().with(Arc::new(NotificationLog::new("schoolcast")));
        let webhook = config
            .notify
            .webhook_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(|url| Arc::new(WebhookSink::new(url, "schoolcast")));
        if let Some(webhook) = &webhook {
            all = all.with(webhook.clone());
        }
        Self {
            all: Arc::new(all),
            webhook,
        }
    }

    async fn flush(&self) {
        if let Some(webhook) = &self.webhook {
            webhook.flush(WEBHOOK_FLUSH_TIMEOUT).await;
        }
    }
}

async fn run_send(
    config: &SchoolCastConfig,
    filter: String,
    include_sent: bool,
    offset: Option<String>,
) -> Result<()> {
    let client = Arc::new(ProviderClient::from_config(&config.api));
    let sinks = Sinks::from_config(config);
    let controller = DispatchController::new(
        client,
        sinks.all.clone(),
        BackoffScheduler::from_config(&config.dispatch)?,
        config.api.dispatch_timeout(),
    );

    let params = DispatchParams::new(filter, config.dispatch.skip_already_sent && !include_sent);
    let offset = offset.map(Offset::from).unwrap_or_default();

    println!("📣 SchoolCast v{}", env!("CARGO_PKG_VERSION"));
    println!("   🌐 Backend: {}", config.api.base_url);
    println!("   🎯 Filter:  {} (skip already sent: {})", params.filter_key, params.skip_already_sent);
    println!("   ☕ Breaks:  {}–{}s", config.dispatch.break_min_secs, config.dispatch.break_max_secs);
    println!();

    let mut feed = controller.subscribe();
    let render = tokio::spawn(async move {
        while feed.changed().await.is_ok() {
            let progress = feed.borrow_and_update().clone();
            render_progress(&progress);
        }
    });

    let run = controller.start(params, offset);
    tokio::pin!(run);
    let outcome = tokio::select! {
        outcome = &mut run => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("🛑 Ctrl-C received, cancelling run...");
            controller.cancel();
            Err(SchoolCastError::Cancelled)
        }
    };
    render.abort();
    sinks.flush().await;

    match outcome {
        Ok(summary) => {
            println!(
                "✅ Done: {} sent, {} failed, {} skipped of {} ({} batches, {} breaks)",
                summary.progress.sent_messages,
                summary.progress.failed_messages,
                summary.progress.skipped_messages,
                summary.progress.total_messages,
                summary.batches,
                summary.breaks_taken
            );
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            println!("🛑 Cancelled");
            Ok(())
        }
        Err(e) if e.is_fatal_to_run() => {
            let partial = controller.progress();
            println!(
                "❌ Stopped after {} sent; resume with --offset {}",
                partial.sent_messages, partial.current_offset
            );
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn render_progress(progress: &BatchProgress) {
    if progress.is_on_break {
        println!(
            "☕ Break: {}s remaining ({} sent so far)",
            progress.break_time_remaining, progress.sent_messages
        );
    } else if progress.total_messages > 0 {
        println!(
            "📤 {}/{} processed: {} sent, {} failed, {} skipped (offset {})",
            progress.processed(),
            progress.total_messages,
            progress.sent_messages,
            progress.failed_messages,
            progress.skipped_messages,
            progress.current_offset
        );
    }
}

async fn run_watch(config: &SchoolCastConfig, ids: Vec<String>) -> Result<()> {
    let ids = if ids.is_empty() {
        config.poller.instances.clone()
    } else {
        ids
    };
    if ids.is_empty() {
        anyhow::bail!("No instances to watch: pass ids or set poller.instances in the config");
    }

    let client = Arc::new(ProviderClient::from_config(&config.api));
    let (poller, mut events) = ConnectionPoller::new(client, config.api.status_timeout());
    poller.reconcile_set(ids);
    let sinks = Sinks::from_config(config);

    println!("📡 Watching {} instance(s): {}", poller.watched().len(), poller.watched().join(", "));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let driver = tokio::spawn({
        let poller = poller.clone();
        let interval = config.poller.interval();
        async move { poller.run(interval, shutdown_rx).await }
    });

    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                ConnectionEvent::Connected { id, phone_number } => {
                    let phone = phone_number.map(|p| format!(" ({p})")).unwrap_or_default();
                    sinks.all.notify_success(&format!("WhatsApp instance {id} connected{phone}"));
                }
                ConnectionEvent::Disconnected { id } => {
                    sinks.all.notify_warning(&format!("WhatsApp instance {id} disconnected"));
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!("🛑 Shutting down poller...");
    shutdown_tx.send(true).ok();
    driver.await?;
    sinks.flush().await;
    Ok(())
}
