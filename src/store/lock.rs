//! Lease-based lock on top of the `locks` table.
//!
//! Acquisition is one conditional upsert: the row is written only when no
//! row exists or the existing lease has expired. There is no renewal. A
//! holder that outlives its lease can lose the lock to a second holder.

use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;

use super::db::{from_millis, now_millis, SqliteStore, SyncLock};
use super::error::StoreError;
use super::types::LeaseInfo;

#[async_trait]
impl SyncLock for SqliteStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let now = now_millis();
        let lease_millis = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(lease_millis);

        let conn = self.conn()?;
        let changed = conn
            .execute(
                r#"
                INSERT INTO locks (name, holder, expires_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(name) DO UPDATE SET
                    holder = excluded.holder,
                    expires_at = excluded.expires_at
                WHERE locks.expires_at <= ?4
                "#,
                rusqlite::params![name, holder, expires_at, now],
            )
            .map_err(StoreError::query)?;

        Ok(changed == 1)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM locks WHERE name = ?1 AND holder = ?2",
                [name, holder],
            )
            .map_err(StoreError::query)?;
        Ok(deleted == 1)
    }

    async fn current_lease(&self, name: &str) -> Result<Option<LeaseInfo>, StoreError> {
        let row: Option<(String, i64)> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT holder, expires_at FROM locks WHERE name = ?1 AND expires_at > ?2",
                rusqlite::params![name, now_millis()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StoreError::query)?
        };

        Ok(row.and_then(|(holder, expires_at)| {
            from_millis(expires_at).map(|expires_at| LeaseInfo { holder, expires_at })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCK: &str = "wp_updater_lock";
    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_second_holder_is_denied() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.try_acquire(LOCK, "a", LEASE).await.unwrap());
        assert!(!store.try_acquire(LOCK, "b", LEASE).await.unwrap());
        // Not re-entrant either.
        assert!(!store.try_acquire(LOCK, "a", LEASE).await.unwrap());

        let lease = store.current_lease(LOCK).await.unwrap().unwrap();
        assert_eq!(lease.holder, "a");
    }

    #[tokio::test]
    async fn test_release_allows_next_holder() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.try_acquire(LOCK, "a", LEASE).await.unwrap());
        assert!(store.release(LOCK, "a").await.unwrap());
        assert!(store.current_lease(LOCK).await.unwrap().is_none());
        assert!(store.try_acquire(LOCK, "b", LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_noop() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.try_acquire(LOCK, "a", LEASE).await.unwrap());
        assert!(!store.release(LOCK, "b").await.unwrap());
        assert!(!store.try_acquire(LOCK, "b", LEASE).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store
            .try_acquire(LOCK, "crashed", Duration::from_millis(20))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(store.current_lease(LOCK).await.unwrap().is_none());
        assert!(store.try_acquire(LOCK, "b", LEASE).await.unwrap());
        // The stale holder can no longer free the new lease.
        assert!(!store.release(LOCK, "crashed").await.unwrap());
        assert_eq!(
            store.current_lease(LOCK).await.unwrap().unwrap().holder,
            "b"
        );
    }

    #[tokio::test]
    async fn test_locks_are_independent_by_name() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.try_acquire("one", "a", LEASE).await.unwrap());
        assert!(store.try_acquire("two", "b", LEASE).await.unwrap());
    }
}
