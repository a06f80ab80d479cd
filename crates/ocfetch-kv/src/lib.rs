//! Key-value state substrate for `ocfetch`.
//!
//! This crate defines the [`KeyValueStore`] trait — a namespaced, TTL-aware
//! durable map with lexicographic range scans. The fetch engine keeps all of
//! its durable state here: the persistent work queue, locator cursors,
//! dedup sets, and retry bookkeeping. Values are opaque bytes; callers pick
//! a [`Codec`] for typed access.
//!
//! Two implementations are provided:
//!
//! - [`MemoryKvStore`] — in-memory `BTreeMap`, for tests and single-shot runs
//! - [`RedisKvStore`] — Redis-backed, for resumable runs (feature `redis-backend`)

mod codec;
mod error;
mod memory;
#[cfg(feature = "redis-backend")]
mod redis_backend;

pub use codec::Codec;
pub use error::StoreError;
pub use memory::MemoryKvStore;
#[cfg(feature = "redis-backend")]
pub use redis_backend::{RedisKvStore, RedisSettings};

use std::time::Duration;

/// A namespaced, TTL-aware key-value store.
///
/// Keys are hierarchical UTF-8 strings using `:` as a separator (e.g.
/// `fetch:run-42:queue:000123`, `locator:us-fl-daily:cursor`). Ordering is
/// lexicographic byte order, which makes range scans over a shared prefix
/// efficient and deterministic.
///
/// Expired entries are invisible to `get`/`exists`/`range_get` and may be
/// reclaimed lazily. Concurrent `put` on the same key is last-writer-wins;
/// a `get` never observes a torn value.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Store a key-value pair, overwriting any existing value.
    ///
    /// A `ttl` of `None` means the entry never expires.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the backing store cannot be
    /// reached. Callers may retry.
    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist or has expired.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the backing store cannot be
    /// reached.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Delete a key. Returns `true` if the key existed (and had not expired).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the backing store cannot be
    /// reached.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Check whether a live (non-expired) entry exists for the key.
    ///
    /// The default implementation calls [`get`](KeyValueStore::get); backends
    /// may override with a cheaper check.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the backing store cannot be
    /// reached.
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Scan entries in lexicographic key order over the half-open range
    /// `[start_key, end_key)`. An absent `end_key` leaves the range
    /// open-ended; `start_key == end_key` yields an empty result. A positive
    /// `limit` caps the number of returned entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the backing store cannot be
    /// reached.
    async fn range_get(
        &self,
        start_key: &str,
        end_key: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Release backend handles. Operations after `close` may fail with
    /// [`StoreError::Unavailable`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the backend fails to shut down
    /// cleanly.
    async fn close(&self) -> Result<(), StoreError>;
}
