//! In-memory key-value store.
//!
//! Entries live in a `BTreeMap` behind a `RwLock`, so range scans come for
//! free from the map's key ordering. TTL bookkeeping is wall-clock: expired
//! entries are invisible to reads and reclaimed lazily on the write path.
//! Not persistent — all state is lost when the process exits.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::{KeyValueStore, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// An in-memory [`KeyValueStore`] backed by a `BTreeMap`.
///
/// Thread-safe and async-compatible. Cloning shares the underlying map.
///
/// # Examples
///
/// ```
/// # use ocfetch_kv::{KeyValueStore, MemoryKvStore};
/// # #[tokio::main]
/// # async fn main() {
/// let store = MemoryKvStore::new();
/// store.put("locator:fr:cursor", b"2024-01-15", None).await.unwrap();
/// let val = store.get("locator:fr:cursor").await.unwrap();
/// assert_eq!(val, Some(b"2024-01-15".to_vec()));
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl MemoryKvStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Runs opportunistically on writes.
    async fn reclaim_expired(&self) {
        let now = Instant::now();
        let mut data = self.data.write().await;
        data.retain(|_, entry| !entry.is_expired(now));
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        self.reclaim_expired().await;
        let mut data = self.data.write().await;
        data.insert(
            key.to_owned(),
            Entry {
                value: value.to_vec(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let data = self.data.read().await;
        let now = Instant::now();
        Ok(data
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut data = self.data.write().await;
        let now = Instant::now();
        match data.remove(key) {
            Some(entry) => Ok(!entry.is_expired(now)),
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let data = self.data.read().await;
        let now = Instant::now();
        Ok(data.get(key).is_some_and(|entry| !entry.is_expired(now)))
    }

    async fn range_get(
        &self,
        start_key: &str,
        end_key: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        if let Some(limit) = limit {
            if limit == 0 {
                return Err(StoreError::InvalidRequest {
                    reason: "limit must be positive".to_owned(),
                });
            }
        }

        let data = self.data.read().await;
        let now = Instant::now();
        let upper = match end_key {
            Some(end) => Bound::Excluded(end.to_owned()),
            None => Bound::Unbounded,
        };

        let entries = data
            .range((Bound::Included(start_key.to_owned()), upper))
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(k, entry)| (k.clone(), entry.value.clone()))
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Ok(entries)
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut data = self.data.write().await;
        data.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_nonexistent_returns_none() {
        let store = MemoryKvStore::new();
        assert_eq!(store.get("does:not:exist").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_and_get_roundtrip() {
        let store = MemoryKvStore::new();
        store.put("k", b"hello", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn put_overwrites_existing() {
        let store = MemoryKvStore::new();
        store.put("k", b"v1", None).await.unwrap();
        store.put("k", b"v2", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn delete_reports_prior_existence() {
        let store = MemoryKvStore::new();
        store.put("k", b"v", None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn ttl_expiry_makes_entry_invisible() {
        let store = MemoryKvStore::new();
        store
            .put("k", b"v", Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_skipped_in_range_scans() {
        let store = MemoryKvStore::new();
        store
            .put("r:a", b"1", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        store.put("r:b", b"2", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        let entries = store.range_get("r:", None, None).await.unwrap();
        assert_eq!(entries, vec![("r:b".to_owned(), b"2".to_vec())]);
    }

    #[tokio::test]
    async fn range_get_is_half_open() {
        let store = MemoryKvStore::new();
        for key in ["a", "b", "c", "d"] {
            store.put(key, key.as_bytes(), None).await.unwrap();
        }

        let entries = store.range_get("b", Some("d"), None).await.unwrap();
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn range_get_equal_bounds_is_empty() {
        let store = MemoryKvStore::new();
        store.put("b", b"v", None).await.unwrap();
        let entries = store.range_get("b", Some("b"), None).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn range_get_open_ended_with_limit() {
        let store = MemoryKvStore::new();
        for key in ["a", "b", "c", "d"] {
            store.put(key, key.as_bytes(), None).await.unwrap();
        }

        let entries = store.range_get("a", None, Some(2)).await.unwrap();
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn range_get_zero_limit_rejected() {
        let store = MemoryKvStore::new();
        let err = store.range_get("a", None, Some(0)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn concurrent_writers_all_land() {
        let store = MemoryKvStore::new();
        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .put(&format!("k:{i}"), format!("v{i}").as_bytes(), None)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        for i in 0..10 {
            let val = store.get(&format!("k:{i}")).await.unwrap();
            assert_eq!(val, Some(format!("v{i}").into_bytes()));
        }
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let store = MemoryKvStore::new();
        let clone = store.clone();
        store.put("k", b"v", None).await.unwrap();
        assert_eq!(clone.get("k").await.unwrap(), Some(b"v".to_vec()));
    }
}
