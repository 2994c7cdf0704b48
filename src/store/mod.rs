//! Shared state for the mirror: the version store, the download queue and
//! the sync lock.
//!
//! All three live in one SQLite database. Every process that opens the same
//! file shares one set of versions, one queue and one lock. The handle is
//! opened once at startup and passed to each component as an
//! `Arc<dyn MirrorStore>`.

pub mod db;
pub mod error;
mod lock;
mod queue;
pub mod schema;
pub mod types;

pub use db::{DownloadQueue, MirrorStore, SqliteStore, SyncHistory, SyncLock, VersionStore};
pub use error::StoreError;
pub use types::{
    latest_version, Category, DownloadItem, LeaseInfo, StoreSummary, SyncRunStats, VersionKey,
    VersionRecord, CORE_IDENTIFIER,
};
