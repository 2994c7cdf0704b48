//! Download worker pool. Each worker pops one item at a time from the
//! shared queue, fetches the archive to its canonical path and marks the
//! version as fetched in the store. Failed items are dropped; the next sync
//! run finds the file still missing and enqueues it again.

pub mod error;
pub mod file;
pub mod paths;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::store::{
    DownloadItem, DownloadQueue, MirrorStore, StoreError, VersionRecord, VersionStore,
};

pub use error::DownloadError;
pub use file::{ArtifactFetcher, HttpFetcher};

/// Pause after the queue itself fails, before popping again.
const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Why a single item was not completed.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("downloaded but could not update the version store: {0}")]
    Store(#[from] StoreError),
}

/// One queue consumer.
pub struct Worker {
    id: usize,
    store: Arc<dyn MirrorStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
    artifact_root: PathBuf,
}

impl Worker {
    pub fn new(
        id: usize,
        store: Arc<dyn MirrorStore>,
        fetcher: Arc<dyn ArtifactFetcher>,
        artifact_root: PathBuf,
    ) -> Self {
        Self {
            id,
            store,
            fetcher,
            artifact_root,
        }
    }

    /// Fetch one item and record it in the store.
    ///
    /// An existing record keeps its URL and attributes; only `fetched_at`
    /// changes. Without one, a record is built from the item itself.
    pub async fn process_item(&self, item: &DownloadItem) -> Result<u64, ItemError> {
        let dest = paths::artifact_path(
            &self.artifact_root,
            item.category,
            &item.identifier,
            &item.version,
        );
        tracing::debug!(
            worker = self.id,
            category = %item.category,
            identifier = %item.identifier,
            version = %item.version,
            path = %dest.display(),
            "Downloading"
        );

        let bytes = self.fetcher.fetch(&item.source_url, &dest).await?;

        let mut record = match self.store.get(&item.key()).await? {
            Some(existing) => existing,
            None => VersionRecord::from(item),
        };
        record.fetched_at = Some(Utc::now());
        self.store.put(&record).await?;

        Ok(bytes)
    }

    /// Pop and process items until `shutdown` is cancelled.
    ///
    /// Cancellation only interrupts the wait for the next item. An item
    /// already popped is always finished.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::debug!(worker = self.id, "Worker started");
        loop {
            let popped = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                popped = self.store.blocking_pop() => popped,
            };

            let item = match popped {
                Ok(item) => item,
                Err(e) => {
                    tracing::warn!(worker = self.id, error = %e, "Queue pop failed");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(STORE_ERROR_BACKOFF) => continue,
                    }
                }
            };

            match self.process_item(&item).await {
                Ok(bytes) => tracing::info!(
                    worker = self.id,
                    category = %item.category,
                    identifier = %item.identifier,
                    version = %item.version,
                    bytes,
                    "Fetched"
                ),
                Err(e) => tracing::error!(
                    worker = self.id,
                    category = %item.category,
                    identifier = %item.identifier,
                    version = %item.version,
                    error = %e,
                    "Download failed, dropping item"
                ),
            }
        }
        tracing::debug!(worker = self.id, "Worker stopped");
    }
}

/// Run `workers` identical workers until `shutdown` is cancelled and every
/// in-flight item has finished.
pub async fn run_pool(
    workers: usize,
    store: Arc<dyn MirrorStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
    artifact_root: PathBuf,
    shutdown: CancellationToken,
) {
    let mut set = JoinSet::new();
    for id in 0..workers {
        let worker = Worker::new(
            id,
            Arc::clone(&store),
            Arc::clone(&fetcher),
            artifact_root.clone(),
        );
        set.spawn(worker.run(shutdown.clone()));
    }
    tracing::info!(workers, root = %artifact_root.display(), "Download workers started");

    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Worker task failed");
        }
    }
    tracing::info!("Download workers stopped");
}
