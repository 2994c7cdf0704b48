//! Sync coordinator.
//!
//! Each run takes the shared sync lease, records any upstream versions the
//! store has not seen, then enqueues a download for every version whose
//! archive is missing locally: every core release, and only the latest
//! version of each plugin and theme. Only one run is in flight across all
//! processes sharing the store. A run that finds the lease taken does
//! nothing.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::download::paths::artifact_path;
use crate::store::{
    latest_version, Category, DownloadItem, DownloadQueue, MirrorStore, StoreError, SyncHistory,
    SyncLock, SyncRunStats, VersionRecord, VersionStore,
};
use crate::systemd::SystemdNotifier;
use crate::upstream::{UpstreamError, UpstreamSource};

/// Name of the lease guarding coordinator runs.
pub const LOCK_NAME: &str = "wp_updater_lock";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Pause between the end of one run and the start of the next.
    pub interval: Duration,
    /// How long an acquired lock stays valid without being released.
    pub lease: Duration,
    pub artifact_root: PathBuf,
}

/// Result of one coordinator iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another holder had the lease. Nothing was read or written.
    LockDenied,
    Completed(SyncRunStats),
}

impl RunOutcome {
    fn status_line(&self) -> String {
        match self {
            RunOutcome::LockDenied => "Sync skipped: lock held elsewhere".to_string(),
            RunOutcome::Completed(stats) => format!(
                "Last sync: {} new versions, {} enqueued, {} categories failed",
                stats.versions_discovered, stats.items_enqueued, stats.categories_failed
            ),
        }
    }
}

/// Outcome of discovery for one category whose manifest was fetched.
#[derive(Debug, Default)]
struct Discovery {
    inserted: u64,
    failed: u64,
}

pub struct Coordinator {
    store: Arc<dyn MirrorStore>,
    source: Arc<dyn UpstreamSource>,
    config: SyncConfig,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn MirrorStore>,
        source: Arc<dyn UpstreamSource>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            source,
            config,
        }
    }

    /// Run iterations on the configured interval until `shutdown` fires.
    ///
    /// A run in progress is completed before the loop exits; only the sleep
    /// between runs is interrupted.
    pub async fn run(&self, shutdown: CancellationToken, notifier: SystemdNotifier) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            lease_secs = self.config.lease.as_secs(),
            "Sync coordinator started"
        );
        while !shutdown.is_cancelled() {
            let outcome = self.run_once().await;
            notifier.notify_status(&outcome.status_line());

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.interval) => {}
            }
        }
        tracing::info!("Sync coordinator stopped");
    }

    /// One coordinator iteration. Never fails: every error is logged and
    /// either skips the run (lock) or the affected category.
    pub async fn run_once(&self) -> RunOutcome {
        let holder = Uuid::new_v4().to_string();
        match self
            .store
            .try_acquire(LOCK_NAME, &holder, self.config.lease)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!("Sync lock is held elsewhere, skipping this run");
                return RunOutcome::LockDenied;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not acquire sync lock, skipping this run");
                return RunOutcome::LockDenied;
            }
        }
        tracing::debug!(%holder, "Acquired sync lock");

        let run_id = match self.store.start_sync_run().await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(error = %e, "Could not record sync run start");
                None
            }
        };

        let stats = self.sync_locked().await;

        match self.store.release(LOCK_NAME, &holder).await {
            Ok(true) => tracing::debug!(%holder, "Released sync lock"),
            Ok(false) => tracing::warn!(
                lease_secs = self.config.lease.as_secs(),
                "Sync lock expired before the run finished; increase the lease"
            ),
            Err(e) => tracing::warn!(error = %e, "Could not release sync lock, it will expire"),
        }

        if let Some(run_id) = run_id {
            if let Err(e) = self.store.complete_sync_run(run_id, &stats).await {
                tracing::warn!(error = %e, "Could not record sync run completion");
            }
        }

        tracing::info!(
            discovered = stats.versions_discovered,
            enqueued = stats.items_enqueued,
            categories_failed = stats.categories_failed,
            enqueue_failures = stats.enqueue_failures,
            discovery_failures = stats.discovery_failures,
            "Sync run complete"
        );
        RunOutcome::Completed(stats)
    }

    async fn sync_locked(&self) -> SyncRunStats {
        let mut stats = SyncRunStats::default();

        for category in Category::ALL {
            match self.discover(category).await {
                Ok(discovery) => {
                    stats.versions_discovered += discovery.inserted;
                    stats.discovery_failures += discovery.failed;
                }
                Err(e) => {
                    tracing::warn!(%category, error = %e, "Upstream discovery failed");
                    stats.categories_failed += 1;
                }
            }

            // The local scan runs even when upstream failed: records from
            // earlier runs may still be missing on disk.
            let missing = match self.find_missing(category).await {
                Ok(missing) => missing,
                Err(e) => {
                    tracing::warn!(%category, error = %e, "Could not scan stored versions");
                    continue;
                }
            };

            for item in missing {
                match self.store.push(&item).await {
                    Ok(()) => {
                        tracing::debug!(
                            %category,
                            identifier = %item.identifier,
                            version = %item.version,
                            "Enqueued download"
                        );
                        stats.items_enqueued += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            %category,
                            identifier = %item.identifier,
                            version = %item.version,
                            error = %e,
                            "Enqueue failed, dropping item until next run"
                        );
                        stats.enqueue_failures += 1;
                    }
                }
            }
        }

        stats
    }

    /// Store upstream versions not yet known. Known triples are left as they
    /// are, so a record's `fetched_at` survives rediscovery. Only a failed
    /// manifest fetch fails the category; a failed write skips that entry.
    async fn discover(&self, category: Category) -> Result<Discovery, UpstreamError> {
        let manifest = self.source.fetch_manifest(category).await?;
        let mut discovery = Discovery::default();
        for record in manifest {
            match self.store.insert_if_absent(&record).await {
                Ok(true) => {
                    tracing::debug!(
                        %category,
                        identifier = %record.identifier,
                        version = %record.version,
                        "Discovered new version"
                    );
                    discovery.inserted += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        %category,
                        identifier = %record.identifier,
                        version = %record.version,
                        error = %e,
                        "Could not store discovered version"
                    );
                    discovery.failed += 1;
                }
            }
        }
        Ok(discovery)
    }

    /// Stored versions whose archive does not exist under the artifact root.
    async fn find_missing(&self, category: Category) -> Result<Vec<DownloadItem>, StoreError> {
        let records = self.store.get_all(category).await?;

        let candidates: Vec<&VersionRecord> = match category {
            Category::Core => records.iter().collect(),
            Category::Plugin | Category::Theme => {
                let mut by_identifier: BTreeMap<&str, Vec<&VersionRecord>> = BTreeMap::new();
                for record in &records {
                    by_identifier
                        .entry(record.identifier.as_str())
                        .or_default()
                        .push(record);
                }
                by_identifier
                    .into_values()
                    .filter_map(|versions| latest_version(versions))
                    .collect()
            }
        };

        let mut missing = Vec::new();
        for record in candidates {
            let path = artifact_path(
                &self.config.artifact_root,
                record.category,
                &record.identifier,
                &record.version,
            );
            // An unreadable path counts as missing; the worker will overwrite it.
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                missing.push(DownloadItem::from(record));
            }
        }
        Ok(missing)
    }
}
