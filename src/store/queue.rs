//! SQLite-backed download queue.
//!
//! Rows are popped with a single `DELETE ... RETURNING` on the lowest id, so
//! each row is delivered to exactly one caller across every process sharing
//! the database file. Nothing is re-queued after a pop: an item whose worker
//! dies is regenerated by the next sync run.

use async_trait::async_trait;
use rusqlite::OptionalExtension;

use super::db::{now_millis, DownloadQueue, SqliteStore};
use super::error::StoreError;
use super::types::DownloadItem;

#[async_trait]
impl DownloadQueue for SqliteStore {
    async fn push(&self, item: &DownloadItem) -> Result<(), StoreError> {
        let payload = serde_json::to_string(item)?;
        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO download_queue (payload, enqueued_at) VALUES (?1, ?2)",
                rusqlite::params![payload, now_millis()],
            )
            .map_err(StoreError::query)?;
        }
        self.queue_signal.notify_one();
        Ok(())
    }

    async fn try_pop(&self) -> Result<Option<DownloadItem>, StoreError> {
        loop {
            let payload: Option<String> = {
                let conn = self.conn()?;
                conn.query_row(
                    "DELETE FROM download_queue WHERE id = (SELECT MIN(id) FROM download_queue) RETURNING payload",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StoreError::query)?
            };

            let Some(payload) = payload else {
                return Ok(None);
            };

            match serde_json::from_str::<DownloadItem>(&payload) {
                Ok(item) => return Ok(Some(item)),
                Err(e) => {
                    tracing::warn!(error = %e, payload = %payload, "Discarding undecodable queue item");
                }
            }
        }
    }

    async fn blocking_pop(&self) -> Result<DownloadItem, StoreError> {
        loop {
            // Register interest before checking, so a push landing between
            // the check and the wait still wakes us.
            let notified = self.queue_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop().await? {
                return Ok(item);
            }

            // Pushes from other processes are only seen by polling.
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn depth(&self) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let depth: i64 = conn
            .query_row("SELECT COUNT(*) FROM download_queue", [], |row| row.get(0))
            .map_err(StoreError::query)?;
        Ok(depth as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::store::types::{Category, CORE_IDENTIFIER};

    fn core_item(version: &str) -> DownloadItem {
        DownloadItem {
            category: Category::Core,
            identifier: CORE_IDENTIFIER.to_string(),
            version: version.to_string(),
            source_url: format!("https://downloads.example.test/wordpress-{version}.zip"),
        }
    }

    #[tokio::test]
    async fn test_push_pop_fifo() {
        let store = SqliteStore::open_in_memory().unwrap();
        for version in ["6.0", "6.1", "6.2"] {
            store.push(&core_item(version)).await.unwrap();
        }
        assert_eq!(store.depth().await.unwrap(), 3);

        for version in ["6.0", "6.1", "6.2"] {
            let item = store.try_pop().await.unwrap().unwrap();
            assert_eq!(item.version, version);
        }
        assert!(store.try_pop().await.unwrap().is_none());
        assert_eq!(store.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queue_does_not_deduplicate() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.push(&core_item("6.2")).await.unwrap();
        store.push(&core_item("6.2")).await.unwrap();
        assert_eq!(store.depth().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_skipped() {
        let store = SqliteStore::open_in_memory().unwrap();
        {
            let conn = store.conn().unwrap();
            conn.execute(
                "INSERT INTO download_queue (payload, enqueued_at) VALUES ('not json', 0)",
                [],
            )
            .unwrap();
        }
        store.push(&core_item("6.2")).await.unwrap();

        let item = store.try_pop().await.unwrap().unwrap();
        assert_eq!(item.version, "6.2");
        assert_eq!(store.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blocking_pop_wakes_on_push() {
        let store = Arc::new(
            SqliteStore::open_in_memory()
                .unwrap()
                .with_poll_interval(Duration::from_secs(60)),
        );

        let popper = {
            let store = store.clone();
            tokio::spawn(async move { store.blocking_pop().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!popper.is_finished());

        store.push(&core_item("6.2")).await.unwrap();
        let item = tokio::time::timeout(Duration::from_secs(5), popper)
            .await
            .expect("pop should wake well before the poll interval")
            .unwrap()
            .unwrap();
        assert_eq!(item.version, "6.2");
    }

    #[tokio::test]
    async fn test_blocking_pop_sees_rows_written_outside_push() {
        // Simulates a push from another process: no in-process notification.
        let store = Arc::new(
            SqliteStore::open_in_memory()
                .unwrap()
                .with_poll_interval(Duration::from_millis(20)),
        );

        let popper = {
            let store = store.clone();
            tokio::spawn(async move { store.blocking_pop().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        {
            let payload = serde_json::to_string(&core_item("6.3")).unwrap();
            let conn = store.conn().unwrap();
            conn.execute(
                "INSERT INTO download_queue (payload, enqueued_at) VALUES (?1, 0)",
                [payload],
            )
            .unwrap();
        }

        let item = tokio::time::timeout(Duration::from_secs(5), popper)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(item.version, "6.3");
    }
}
