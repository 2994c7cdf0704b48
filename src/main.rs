//! wpmirror: keeps a local mirror of WordPress core, plugin and theme
//! release archives.
//!
//! A sync coordinator periodically diffs the WordPress.org release APIs
//! against a SQLite version store and queues downloads for archives missing
//! on disk; a pool of workers drains that queue. Any number of processes may
//! share one database: a lease lock keeps sync runs exclusive, and the queue
//! hands each item to exactly one worker.

#![warn(clippy::all)]

mod cli;
mod config;
mod download;
mod shutdown;
mod store;
mod sync;
mod systemd;
mod types;
mod upstream;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use config::Config;
use download::HttpFetcher;
use store::{MirrorStore, SqliteStore, SyncHistory, SyncLock, VersionRecord, VersionStore};
use sync::{Coordinator, RunOutcome, SyncConfig};
use systemd::SystemdNotifier;
use upstream::WordPressOrgSource;

async fn open_store(config: &Config) -> anyhow::Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(&config.database)
        .await
        .with_context(|| format!("Failed to open database {}", config.database.display()))?
        .with_poll_interval(config.queue_poll);
    Ok(Arc::new(store))
}

fn http_client(config: &Config) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("wpmirror/", env!("CARGO_PKG_VERSION")))
        .timeout(config.http_timeout)
        .build()
        .context("Failed to build HTTP client")
}

fn coordinator(
    config: &Config,
    store: Arc<dyn MirrorStore>,
    client: reqwest::Client,
) -> Coordinator {
    let source = WordPressOrgSource::new(client, config.upstream.clone());
    Coordinator::new(
        store,
        Arc::new(source),
        SyncConfig {
            interval: config.interval,
            lease: config.lease,
            artifact_root: config.artifact_root.clone(),
        },
    )
}

/// Coordinator and workers in one process until a shutdown signal.
async fn run_daemon(config: &Config, with_sync: bool, with_workers: bool) -> anyhow::Result<()> {
    let store: Arc<dyn MirrorStore> = open_store(config).await?;
    let client = http_client(config)?;
    let shutdown = shutdown::install_signal_handler()?;
    let notifier = SystemdNotifier::new(config.notify_systemd);

    tracing::info!(
        database = %config.database.display(),
        root = %config.artifact_root.display(),
        sync = with_sync,
        workers = if with_workers { config.workers } else { 0 },
        "Starting wpmirror"
    );
    notifier.notify_ready();

    let sync_loop = async {
        if with_sync {
            coordinator(config, Arc::clone(&store), client.clone())
                .run(shutdown.clone(), notifier)
                .await;
        }
    };
    let worker_pool = async {
        if with_workers {
            download::run_pool(
                usize::from(config.workers),
                Arc::clone(&store),
                Arc::new(HttpFetcher::new(client.clone())),
                config.artifact_root.clone(),
                shutdown.clone(),
            )
            .await;
        }
    };
    let stopping = async {
        shutdown.cancelled().await;
        notifier.notify_stopping();
    };

    tokio::join!(sync_loop, worker_pool, stopping);
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn run_sync_once(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let client = http_client(config)?;

    match coordinator(config, store, client).run_once().await {
        RunOutcome::LockDenied => {
            println!("Another sync run holds the lock; nothing done.");
        }
        RunOutcome::Completed(stats) => {
            println!("Sync complete:");
            println!("  New versions:       {}", stats.versions_discovered);
            println!("  Enqueued:           {}", stats.items_enqueued);
            println!("  Failed categories:  {}", stats.categories_failed);
            println!("  Enqueue failures:   {}", stats.enqueue_failures);
            println!("  Store failures:     {}", stats.discovery_failures);
        }
    }
    Ok(())
}

async fn run_status(config: &Config) -> anyhow::Result<()> {
    if !config.database.exists() {
        println!("No database found at {}", config.database.display());
        println!("Run a sync first to create it.");
        return Ok(());
    }

    let store = open_store(config).await?;
    let summary = store.get_summary().await?;
    let lease = store.current_lease(sync::LOCK_NAME).await?;

    println!("Database: {}", store.path().display());
    println!();
    println!("Versions:");
    println!("  Core releases: {}", summary.core_versions);
    println!("  Plugins:       {}", summary.plugins);
    println!("  Themes:        {}", summary.themes);
    println!("  Total:         {}", summary.total_versions);
    println!("  Fetched:       {}", summary.fetched_versions);
    println!();
    println!("Queue depth: {}", summary.queue_depth);

    match lease {
        Some(lease) => println!(
            "Sync lock:   held by {} until {}",
            lease.holder,
            lease.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => println!("Sync lock:   free"),
    }

    if let Some(started) = &summary.last_sync_started {
        println!(
            "Last sync started:   {}",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(completed) = &summary.last_sync_completed {
        println!(
            "Last sync completed: {}",
            completed.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    Ok(())
}

async fn run_seed(config: &Config, file: &Path) -> anyhow::Result<()> {
    let contents = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let records: Vec<VersionRecord> = serde_json::from_str(&contents)
        .with_context(|| format!("{} is not a JSON array of version records", file.display()))?;
    let records = records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            record
                .validated()
                .with_context(|| format!("Record {index} in {} is invalid", file.display()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let store = open_store(config).await?;
    for record in &records {
        store.put(record).await?;
        tracing::debug!(key = %record.key(), "Seeded");
    }
    println!("Seeded {} version records", records.len());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    let config = Config::from_cli(&cli)?;
    tracing::debug!(?config, "Resolved configuration");

    match &cli.command {
        Command::Run => run_daemon(&config, true, true).await,
        Command::Sync { once: true } => run_sync_once(&config).await,
        Command::Sync { once: false } => run_daemon(&config, true, false).await,
        Command::Worker => run_daemon(&config, false, true).await,
        Command::Status => run_status(&config).await,
        Command::Seed { file } => run_seed(&config, file).await,
    }
}
