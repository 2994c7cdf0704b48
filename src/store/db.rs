//! Store traits and the SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Notify;

use super::error::StoreError;
use super::schema;
use super::types::{
    Category, DownloadItem, LeaseInfo, StoreSummary, SyncRunStats, VersionKey, VersionRecord,
};

/// How long a second process waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval at which a blocked pop re-checks the queue for items
/// pushed by other processes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Mapping from `(category, identifier, version)` to version records.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Insert or replace the record stored under the record's triple.
    async fn put(&self, record: &VersionRecord) -> Result<(), StoreError>;

    /// Store the record only if its triple is unknown. Returns whether a row
    /// was written; an existing record is left untouched.
    async fn insert_if_absent(&self, record: &VersionRecord) -> Result<bool, StoreError>;

    /// Look up a single triple.
    async fn get(&self, key: &VersionKey) -> Result<Option<VersionRecord>, StoreError>;

    /// All records of a category, newest version string first.
    async fn get_all(&self, category: Category) -> Result<Vec<VersionRecord>, StoreError>;

    /// All records of one identifier, newest version string first.
    async fn get_versions(
        &self,
        category: Category,
        identifier: &str,
    ) -> Result<Vec<VersionRecord>, StoreError>;

    /// Identifiers with at least one stored record.
    async fn list_identifiers(&self, category: Category) -> Result<Vec<String>, StoreError>;

    /// The record with the lexicographically greatest version, if any.
    ///
    /// See [`super::types::latest_version`] for the comparison rule.
    async fn latest(
        &self,
        category: Category,
        identifier: &str,
    ) -> Result<Option<VersionRecord>, StoreError>;
}

/// Durable FIFO of download work.
#[async_trait]
pub trait DownloadQueue: Send + Sync {
    /// Append an item. Never waits for a consumer.
    async fn push(&self, item: &DownloadItem) -> Result<(), StoreError>;

    /// Remove and return the oldest item, if there is one.
    async fn try_pop(&self) -> Result<Option<DownloadItem>, StoreError>;

    /// Wait until an item is available, then remove and return it.
    async fn blocking_pop(&self) -> Result<DownloadItem, StoreError>;

    /// Number of queued items.
    async fn depth(&self) -> Result<u64, StoreError>;
}

/// Named, self-expiring mutual exclusion.
#[async_trait]
pub trait SyncLock: Send + Sync {
    /// Take the lease unless another holder has an unexpired one.
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    /// Drop the lease if `holder` still owns it. Returns whether it did.
    async fn release(&self, name: &str, holder: &str) -> Result<bool, StoreError>;

    /// The unexpired lease on `name`, if any.
    async fn current_lease(&self, name: &str) -> Result<Option<LeaseInfo>, StoreError>;
}

/// Bookkeeping of coordinator runs.
#[async_trait]
pub trait SyncHistory: Send + Sync {
    /// Start a new sync run and return its ID.
    async fn start_sync_run(&self) -> Result<i64, StoreError>;

    /// Complete a sync run with statistics.
    async fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats)
        -> Result<(), StoreError>;

    /// Get a summary of the store contents.
    async fn get_summary(&self) -> Result<StoreSummary, StoreError>;
}

/// Everything the coordinator and workers need from one backing store.
///
/// Usable as `Arc<dyn MirrorStore>` so a single handle, opened once at
/// startup, can be shared by every task.
pub trait MirrorStore: VersionStore + DownloadQueue + SyncLock + SyncHistory {}

impl<T> MirrorStore for T where T: VersionStore + DownloadQueue + SyncLock + SyncHistory {}

/// SQLite implementation of the store.
pub struct SqliteStore {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    /// The guard is never held across an await point.
    conn: Mutex<Connection>,
    /// Path to the database file (for error messages).
    path: PathBuf,
    /// Wakes in-process poppers when an item is pushed.
    pub(super) queue_signal: Notify,
    pub(super) poll_interval: Duration,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path_clone.parent() {
                if !parent.as_os_str().is_empty() {
                    let _ = std::fs::create_dir_all(parent);
                }
            }

            let conn = Connection::open(&path_clone).map_err(|e| StoreError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            // WAL lets the coordinator and worker processes read while one writes.
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StoreError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StoreError::Migration)?;
            conn.busy_timeout(BUSY_TIMEOUT)
                .map_err(StoreError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::Query(format!("store open task failed: {e}")))??;

        Ok(Self::from_connection(conn, path))
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self::from_connection(conn, PathBuf::from(":memory:")))
    }

    fn from_connection(conn: Connection, path: PathBuf) -> Self {
        Self {
            conn: Mutex::new(conn),
            path,
            queue_signal: Notify::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set how often a blocked pop re-checks the queue.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(super) fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))
    }
}

pub(super) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(super) fn from_millis(ts: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ts).single()
}

const RECORD_COLUMNS: &str = "category, identifier, version, source_url, attributes, fetched_at";

/// Raw column values of one `versions` row.
type RecordRow = (String, String, String, String, String, Option<i64>);

fn read_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn record_from_row(row: RecordRow) -> Result<VersionRecord, StoreError> {
    let (category, identifier, version, source_url, attributes, fetched_at) = row;
    let category = Category::from_str(&category)
        .ok_or_else(|| StoreError::Query(format!("unknown category '{category}' in store")))?;
    Ok(VersionRecord {
        category,
        identifier,
        version,
        source_url,
        attributes: serde_json::from_str(&attributes)?,
        fetched_at: fetched_at.and_then(from_millis),
    })
}

impl SqliteStore {
    fn query_records(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<VersionRecord>, StoreError> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare_cached(sql).map_err(StoreError::query)?;
            let rows = stmt
                .query_map(params, read_record_row)
                .map_err(StoreError::query)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StoreError::query)?;
            rows
        };
        rows.into_iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl VersionStore for SqliteStore {
    async fn put(&self, record: &VersionRecord) -> Result<(), StoreError> {
        let key = record.key();
        let attributes = serde_json::to_string(&record.attributes)?;
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO versions (category, identifier, version, source_url, attributes, fetched_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(category, identifier, version) DO UPDATE SET
                source_url = excluded.source_url,
                attributes = excluded.attributes,
                fetched_at = excluded.fetched_at
            "#,
            rusqlite::params![
                key.category.as_str(),
                &key.identifier,
                &key.version,
                &record.source_url,
                attributes,
                record.fetched_at.map(|dt| dt.timestamp_millis()),
            ],
        )
        .map_err(StoreError::query)?;

        Ok(())
    }

    async fn insert_if_absent(&self, record: &VersionRecord) -> Result<bool, StoreError> {
        let key = record.key();
        let attributes = serde_json::to_string(&record.attributes)?;
        let conn = self.conn()?;

        let inserted = conn
            .execute(
                r#"
                INSERT INTO versions (category, identifier, version, source_url, attributes, fetched_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(category, identifier, version) DO NOTHING
                "#,
                rusqlite::params![
                    key.category.as_str(),
                    &key.identifier,
                    &key.version,
                    &record.source_url,
                    attributes,
                    record.fetched_at.map(|dt| dt.timestamp_millis()),
                ],
            )
            .map_err(StoreError::query)?;

        Ok(inserted == 1)
    }

    async fn get(&self, key: &VersionKey) -> Result<Option<VersionRecord>, StoreError> {
        let row = {
            let conn = self.conn()?;
            conn.query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM versions WHERE category = ?1 AND identifier = ?2 AND version = ?3"
                ),
                [
                    key.category.as_str(),
                    key.identifier.as_str(),
                    key.version.as_str(),
                ],
                read_record_row,
            )
            .optional()
            .map_err(StoreError::query)?
        };
        row.map(record_from_row).transpose()
    }

    async fn get_all(&self, category: Category) -> Result<Vec<VersionRecord>, StoreError> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM versions WHERE category = ?1 ORDER BY version DESC, identifier"
            ),
            &[&category.as_str()],
        )
    }

    async fn get_versions(
        &self,
        category: Category,
        identifier: &str,
    ) -> Result<Vec<VersionRecord>, StoreError> {
        let key = VersionKey::new(category, identifier, "");
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM versions WHERE category = ?1 AND identifier = ?2 ORDER BY version DESC"
            ),
            &[&category.as_str(), &key.identifier],
        )
    }

    async fn list_identifiers(&self, category: Category) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT DISTINCT identifier FROM versions WHERE category = ?1 ORDER BY identifier",
            )
            .map_err(StoreError::query)?;
        let identifiers = stmt
            .query_map([category.as_str()], |row| row.get::<_, String>(0))
            .map_err(StoreError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::query)?;
        Ok(identifiers)
    }

    async fn latest(
        &self,
        category: Category,
        identifier: &str,
    ) -> Result<Option<VersionRecord>, StoreError> {
        // SQLite's default BINARY collation orders TEXT byte-wise, the same
        // rule as `latest_version`.
        let mut records = self.get_versions(category, identifier).await?;
        if records.is_empty() {
            return Ok(None);
        }
        Ok(Some(records.swap_remove(0)))
    }
}

#[async_trait]
impl SyncHistory for SqliteStore {
    async fn start_sync_run(&self) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_runs (started_at) VALUES (?1)",
            [now_millis()],
        )
        .map_err(StoreError::query)?;
        Ok(conn.last_insert_rowid())
    }

    async fn complete_sync_run(
        &self,
        run_id: i64,
        stats: &SyncRunStats,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sync_runs SET completed_at = ?1, versions_discovered = ?2, items_enqueued = ?3, categories_failed = ?4, enqueue_failures = ?5, discovery_failures = ?6 WHERE id = ?7",
            rusqlite::params![
                now_millis(),
                stats.versions_discovered as i64,
                stats.items_enqueued as i64,
                stats.categories_failed as i64,
                stats.enqueue_failures as i64,
                stats.discovery_failures as i64,
                run_id,
            ],
        )
        .map_err(StoreError::query)?;
        Ok(())
    }

    async fn get_summary(&self) -> Result<StoreSummary, StoreError> {
        let conn = self.conn()?;

        let count = |sql: &str| -> Result<u64, StoreError> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
                .map_err(StoreError::query)
        };

        let core_versions = count("SELECT COUNT(*) FROM versions WHERE category = 'core'")?;
        let plugins =
            count("SELECT COUNT(DISTINCT identifier) FROM versions WHERE category = 'plugin'")?;
        let themes =
            count("SELECT COUNT(DISTINCT identifier) FROM versions WHERE category = 'theme'")?;
        let total_versions = count("SELECT COUNT(*) FROM versions")?;
        let fetched_versions =
            count("SELECT COUNT(*) FROM versions WHERE fetched_at IS NOT NULL")?;
        let queue_depth = count("SELECT COUNT(*) FROM download_queue")?;

        let last_sync: Option<(i64, Option<i64>)> = conn
            .query_row(
                "SELECT started_at, completed_at FROM sync_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StoreError::query)?;

        let (last_sync_started, last_sync_completed) = match last_sync {
            Some((started, completed)) => (from_millis(started), completed.and_then(from_millis)),
            None => (None, None),
        };

        Ok(StoreSummary {
            core_versions,
            plugins,
            themes,
            total_versions,
            fetched_versions,
            queue_depth,
            last_sync_started,
            last_sync_completed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{latest_version, CORE_IDENTIFIER};
    use serde_json::json;

    fn plugin(identifier: &str, version: &str) -> VersionRecord {
        VersionRecord::new(
            Category::Plugin,
            identifier,
            version,
            &format!("https://downloads.example.test/{identifier}.{version}.zip"),
            json!({ "requires_php": "7.4" }),
        )
    }

    #[tokio::test]
    async fn test_open_creates_db() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mirror.db");
        let store = SqliteStore::open(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), path);
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = SqliteStore::open_in_memory().unwrap();
        let record = VersionRecord::core(
            "6.2.1",
            "https://downloads.example.test/wordpress-6.2.1.zip",
            json!({ "php_version": "5.6.20", "mysql_version": "5.0" }),
        );
        store.put(&record).await.unwrap();

        let stored = store.get(&record.key()).await.unwrap().unwrap();
        assert_eq!(stored, record);
        assert!(store
            .get(&VersionKey::new(Category::Core, CORE_IDENTIFIER, "6.1.3"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let record = plugin("akismet", "5.1");

        store.put(&record).await.unwrap();
        let once = store.get_all(Category::Plugin).await.unwrap();
        store.put(&record).await.unwrap();
        let twice = store.get_all(Category::Plugin).await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
    }

    #[tokio::test]
    async fn test_put_upserts_by_triple() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut record = plugin("akismet", "5.1");
        store.put(&record).await.unwrap();

        record.fetched_at = Some(Utc::now());
        record.source_url = "https://mirror.example.test/akismet.5.1.zip".to_string();
        store.put(&record).await.unwrap();

        let all = store.get_all(Category::Plugin).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].source_url, record.source_url);
        assert!(all[0].fetched_at.is_some());
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_existing_record() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut fetched = plugin("akismet", "5.1");
        fetched.fetched_at = Some(Utc::now());
        assert!(store.insert_if_absent(&fetched).await.unwrap());

        let rediscovered = VersionRecord::new(
            Category::Plugin,
            "akismet",
            "5.1",
            "https://other.example.test/akismet.5.1.zip",
            json!({}),
        );
        assert!(!store.insert_if_absent(&rediscovered).await.unwrap());

        let stored = store.get(&fetched.key()).await.unwrap().unwrap();
        assert_eq!(stored.source_url, fetched.source_url);
        assert!(stored.fetched_at.is_some());
        assert_eq!(store.get_all(Category::Plugin).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_all_is_scoped_and_sorted() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(&plugin("akismet", "5.0")).await.unwrap();
        store.put(&plugin("akismet", "5.1")).await.unwrap();
        store
            .put(&VersionRecord::core("6.2.1", "https://x.test/wp.zip", json!({})))
            .await
            .unwrap();

        let plugins = store.get_all(Category::Plugin).await.unwrap();
        let versions: Vec<_> = plugins.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, ["5.1", "5.0"]);

        assert_eq!(store.get_all(Category::Core).await.unwrap().len(), 1);
        assert!(store.get_all(Category::Theme).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_identifiers() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .put(&plugin("contact-form-7/wp-contact-form-7.php", "5.7.2"))
            .await
            .unwrap();
        store.put(&plugin("akismet/akismet.php", "5.1")).await.unwrap();
        store.put(&plugin("akismet/akismet.php", "5.0")).await.unwrap();

        let identifiers = store.list_identifiers(Category::Plugin).await.unwrap();
        assert_eq!(
            identifiers,
            ["akismet/akismet.php", "contact-form-7/wp-contact-form-7.php"]
        );
        assert!(store
            .list_identifiers(Category::Theme)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_latest_matches_in_memory_rule() {
        let store = SqliteStore::open_in_memory().unwrap();
        let records = [plugin("akismet", "1.10"), plugin("akismet", "1.9")];
        for record in &records {
            store.put(record).await.unwrap();
        }

        let latest = store
            .latest(Category::Plugin, "akismet")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.version, "1.9");
        assert_eq!(
            latest_version(&records).map(|r| r.version.as_str()),
            Some("1.9")
        );

        assert!(store
            .latest(Category::Plugin, "missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_latest_core_uses_singleton_identifier() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .put(&VersionRecord::core("6.1.3", "https://x.test/6.1.3.zip", json!({})))
            .await
            .unwrap();
        store
            .put(&VersionRecord::core("6.2.1", "https://x.test/6.2.1.zip", json!({})))
            .await
            .unwrap();

        let latest = store.latest(Category::Core, "").await.unwrap().unwrap();
        assert_eq!(latest.version, "6.2.1");
        assert_eq!(
            store.list_identifiers(Category::Core).await.unwrap(),
            [CORE_IDENTIFIER]
        );
    }

    #[tokio::test]
    async fn test_sync_run_lifecycle_and_summary() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(&plugin("akismet", "5.1")).await.unwrap();
        let mut fetched = plugin("hello-dolly", "1.7.2");
        fetched.fetched_at = Some(Utc::now());
        store.put(&fetched).await.unwrap();

        let run_id = store.start_sync_run().await.unwrap();
        let summary = store.get_summary().await.unwrap();
        assert!(summary.last_sync_started.is_some());
        assert!(summary.last_sync_completed.is_none());

        let stats = SyncRunStats {
            versions_discovered: 2,
            items_enqueued: 1,
            discovery_failures: 1,
            ..Default::default()
        };
        store.complete_sync_run(run_id, &stats).await.unwrap();

        let summary = store.get_summary().await.unwrap();
        assert_eq!(summary.plugins, 2);
        assert_eq!(summary.total_versions, 2);
        assert_eq!(summary.fetched_versions, 1);
        assert_eq!(summary.core_versions, 0);
        assert!(summary.last_sync_completed.is_some());
    }
}
