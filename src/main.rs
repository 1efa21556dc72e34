//! Vault Ledger Daemon
//!
//! ## Usage
//!
//! ```bash
//! # Run reconciliation consumers until Ctrl+C
//! vault-ledger run
//!
//! # Enqueue on-chain events from a JSON-lines feed
//! vault-ledger ingest events.jsonl
//!
//! # Apply everything queued, then exit
//! vault-ledger drain
//!
//! # Operator epoch rollover
//! vault-ledger close-epoch
//!
//! # Current epoch, table counts and queue depth as JSON
//! vault-ledger status
//!
//! # Registered users, a page at a time
//! vault-ledger users --limit 50 --offset 100
//! ```
//!
//! Each feed line looks like
//! `{"tx_hash":"0x..","log_index":0,"block_number":12,"kind":"DepositRequested","data":{..}}`.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vault_ledger::services::spawn_logging_listener;
use vault_ledger::{Config, EnqueueOutcome, Ledger, Principal, RawEvent};

#[derive(Parser, Debug)]
#[command(name = "vault-ledger")]
#[command(about = "Settlement ledger for a deposit/withdrawal/borrow vault")]
struct Args {
    /// Path to config file
    #[arg(short, long, global = true, env = "VAULT_LEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, global = true, env = "VAULT_LEDGER_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Number of reconciliation consumers (run only)
    #[arg(long, global = true)]
    consumers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run reconciliation consumers and epoch rollover until Ctrl+C
    Run,
    /// Enqueue events from a JSON-lines file
    Ingest {
        path: PathBuf,
    },
    /// Drain the queue once and exit
    Drain,
    /// Close the active epoch and open the next
    CloseEpoch,
    /// Print ledger status as JSON
    Status,
    /// List registered users as JSON
    Users {
        #[arg(long, default_value_t = 100)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vault_ledger=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &args);

    let ledger = Arc::new(Ledger::open(&config).context("opening ledger")?);

    let config_path = config.config_path();
    if args.config.is_none() && !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    match args.command {
        Command::Run => run(ledger).await,
        Command::Ingest { path } => ingest(&ledger, &path),
        Command::Drain => {
            let sync = ledger.sync();
            let report = tokio::task::spawn_blocking(move || sync.drain()).await??;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::CloseEpoch => {
            let rollover = ledger.close_current_epoch(&Principal::admin("operator:cli"))?;
            println!("{}", serde_json::to_string_pretty(&rollover)?);
            Ok(())
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&ledger.status()?)?);
            Ok(())
        }
        Command::Users { limit, offset } => {
            println!("{}", serde_json::to_string_pretty(&ledger.list_users(limit, offset)?)?);
            Ok(())
        }
    }
}

/// Command-line flags win over the config file
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(dir) = &args.storage_dir {
        config.storage_dir = dir.clone();
    }
    if let Some(consumers) = args.consumers {
        config.consumer_count = consumers;
    }
}

async fn run(ledger: Arc<Ledger>) -> anyhow::Result<()> {
    let config = ledger.config().clone();
    info!(
        storage_dir = %config.storage_dir.display(),
        consumers = config.consumer_count,
        "Starting vault-ledger"
    );

    let _listener = spawn_logging_listener(ledger.events.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();
    for _ in 0..config.consumer_count.max(1) {
        let sync = Arc::new(ledger.sync());
        handles.push(tokio::spawn(sync.run_consumer(config.poll_interval(), shutdown_rx.clone())));
    }

    // Automatic epoch rollover
    if config.epoch_duration_secs > 0 {
        let epochs = ledger.epochs.clone();
        let mut shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let principal = Principal::admin("operator:scheduler");
            let mut ticker = tokio::time::interval(Duration::from_secs(1).max(config.poll_interval()));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let epochs = epochs.clone();
                        let principal = principal.clone();
                        match tokio::task::spawn_blocking(move || epochs.close_if_expired(&principal)).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!(error = %e, "Epoch rollover check failed"),
                            Err(e) => error!(error = %e, "Epoch rollover task panicked"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Worker task failed");
        }
    }
    info!("vault-ledger stopped");
    Ok(())
}

fn ingest(ledger: &Ledger, path: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;

    let (mut enqueued, mut duplicates, mut rejected) = (0u64, 0u64, 0u64);
    for (line_no, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let raw: RawEvent = match serde_json::from_str(&line) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "Skipping malformed line");
                rejected += 1;
                continue;
            }
        };
        let event = match raw.decode() {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_no + 1, external_id = %raw.external_id(), error = %e, "Skipping undecodable event");
                rejected += 1;
                continue;
            }
        };

        match ledger.enqueue_event(&raw.external_id(), &event, raw.position())? {
            EnqueueOutcome::Enqueued => enqueued += 1,
            EnqueueOutcome::Duplicate => duplicates += 1,
        }
    }

    info!(enqueued = enqueued, duplicates = duplicates, rejected = rejected, "Ingest complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::try_parse_from(["vault-ledger", "--consumers", "4", "--storage-dir", "/tmp/vl", "status"]).unwrap();
        let mut config = Config::default();
        apply_overrides(&mut config, &args);
        assert_eq!(config.consumer_count, 4);
        assert_eq!(config.storage_dir, PathBuf::from("/tmp/vl"));
    }

    #[test]
    fn test_config_kept_without_flags() {
        let args = Args::try_parse_from(["vault-ledger", "drain"]).unwrap();
        let mut config = Config::default();
        let before = config.consumer_count;
        apply_overrides(&mut config, &args);
        assert_eq!(config.consumer_count, before);
    }

    #[test]
    fn test_users_paging_flags() {
        let args = Args::try_parse_from(["vault-ledger", "users", "--limit", "5", "--offset", "10"]).unwrap();
        assert!(matches!(args.command, Command::Users { limit: 5, offset: 10 }));
    }
}
