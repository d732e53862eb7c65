//! resilient-batch - operator CLI
//!
//! 세션 조회/제어 및 원격 세션 상태 점검. Starting or resuming a run needs the
//! domain collaborators and is done through the library.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use resilient_batch::application::{HealthMonitor, SessionAdmin};
use resilient_batch::domain::entities::{Item, Session};
use resilient_batch::infrastructure::config::{AppConfig, ConfigManager};
use resilient_batch::infrastructure::devtools_session::DevToolsSessionProvider;
use resilient_batch::infrastructure::logging::init_logging_with_config;
use resilient_batch::infrastructure::payload_store::PayloadStore;
use resilient_batch::infrastructure::state_store::SqliteStateStore;

#[derive(Parser)]
#[command(name = "resilient-batch", version, about = "Inspect and control resumable batch sessions")]
struct Cli {
    #[arg(long, global = true, help = "Path to the JSON config file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Print machine-readable JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every session with its counts
    List {
        #[arg(long, help = "Only sessions that can be resumed")]
        resumable: bool,
    },
    /// Per-item report for one session
    Report { session: String },
    /// Pause a session; a running worker stops at its next item boundary
    Pause { session: String },
    /// Cancel a session back to idle
    Cancel { session: String },
    /// Delete a session with its items, checkpoints and samples
    Delete { session: String },
    /// Delete every session
    Clear {
        #[arg(long, help = "Confirm deletion of all state")]
        yes: bool,
    },
    /// Requeue an item that ended in error
    RetryItem { item: String },
    /// Abandon an item permanently
    SkipItem { item: String },
    /// Supply missing fields for a needs-manual-input item and requeue it
    ResubmitItem {
        item: String,
        #[arg(long, help = "JSON object merged into the stored payload")]
        fields: String,
    },
    /// Check a DevTools endpoint, e.g. http://127.0.0.1:9222
    Probe {
        endpoint: String,
        #[arg(long, help = "Keep probing until Ctrl-C")]
        watch: bool,
        #[arg(long, default_value_t = 5, help = "Seconds between probes with --watch")]
        interval_secs: u64,
    },
    /// Show or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write the default configuration if none exists
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let config = manager.initialize_on_first_run().await?;
    init_logging_with_config(&config.logging)?;

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("# {}", manager.config_path.display());
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Init => {
                println!("Configuration ready at {}", manager.config_path.display());
            }
        },
        Commands::Probe {
            endpoint,
            watch,
            interval_secs,
        } => probe(&config, &endpoint, watch, Duration::from_secs(interval_secs.max(1))).await?,
        command => {
            let admin = open_admin(&config).await?;
            run_admin_command(&admin, command, cli.json).await?;
        }
    }
    Ok(())
}

async fn open_admin(config: &AppConfig) -> Result<SessionAdmin> {
    let payloads = PayloadStore::new(
        &config.storage.payload_dir,
        config.storage.max_inline_payload_bytes,
    );
    let store = SqliteStateStore::open(&config.storage.state_database_url, payloads)
        .await
        .with_context(|| format!("opening {}", config.storage.state_database_url))?;
    Ok(SessionAdmin::new(store))
}

async fn run_admin_command(admin: &SessionAdmin, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::List { resumable } => {
            let sessions = if resumable {
                admin.list_resumable().await?
            } else {
                admin.list_sessions().await?
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                println!("No sessions");
            } else {
                for session in &sessions {
                    print_session(session);
                }
            }
        }
        Commands::Report { session } => {
            let report = admin.session_report(&session).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_session(&report.session);
                if let Some(checkpoint) = &report.latest_checkpoint {
                    println!("  checkpoint: {} at {}", checkpoint.entity_ref, checkpoint.created_at);
                }
                for item in &report.items {
                    println!(
                        "  {:<36} {:<20} {:<18} retries={} {}",
                        item.item_id,
                        item.entity_ref,
                        item.status.to_string(),
                        item.retry_count,
                        item.last_error.as_deref().unwrap_or("")
                    );
                }
            }
        }
        Commands::Pause { session } => print_session(&admin.pause(&session).await?),
        Commands::Cancel { session } => print_session(&admin.cancel(&session).await?),
        Commands::Delete { session } => {
            if admin.delete(&session).await? {
                println!("Deleted session {session}");
            } else {
                bail!("session {session} not found");
            }
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("refusing to delete all sessions without --yes");
            }
            admin.clear_all().await?;
            println!("All sessions deleted");
        }
        Commands::RetryItem { item } => print_item(&admin.retry_item(&item).await?),
        Commands::SkipItem { item } => print_item(&admin.skip_item(&item).await?),
        Commands::ResubmitItem { item, fields } => {
            let fields: serde_json::Value =
                serde_json::from_str(&fields).context("--fields must be valid JSON")?;
            print_item(&admin.resubmit_item(&item, fields).await?);
        }
        Commands::Probe { .. } | Commands::Config { .. } => {
            bail!("command does not operate on the state store")
        }
    }
    Ok(())
}

async fn probe(config: &AppConfig, endpoint: &str, watch: bool, interval: Duration) -> Result<()> {
    let provider = Arc::new(DevToolsSessionProvider::new(
        endpoint,
        config.health.probe_timeout(),
    )?);

    if !watch {
        let version = provider.probe().await?;
        println!("{} (protocol {})", version.browser, version.protocol_version);
        println!("{}", version.web_socket_debugger_url);
        return Ok(());
    }

    let monitor = HealthMonitor::new(provider, config.health.probe_timeout());
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Ctrl-C received, stopping probe loop");
        }
        signal_token.cancel();
    });

    loop {
        match monitor.ensure_healthy().await {
            Ok(_) => {
                let stats = monitor.stats();
                println!(
                    "healthy   probes={} failures={} recoveries={}",
                    stats.probes, stats.failures, stats.recoveries
                );
            }
            Err(e) => {
                warn!("Probe failed: {}", e);
                println!("unhealthy {e}");
            }
        }
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
    monitor.release().await;
    Ok(())
}

fn print_session(session: &Session) {
    let c = session.counts;
    println!(
        "{}  {:<8} total={} complete={} error={} pending={} manual={}  created {}",
        session.id,
        session.status.to_string(),
        c.total,
        c.complete,
        c.error,
        c.pending,
        c.needs_manual_input,
        session.created_at.format("%Y-%m-%d %H:%M:%S")
    );
}

fn print_item(item: &Item) {
    println!(
        "{}  {}  {}  retries={}",
        item.id, item.entity_ref, item.status, item.retry_count
    );
}
