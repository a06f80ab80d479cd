//! Redis-backed key-value store.
//!
//! Keys are stored under a configurable prefix so several fetchers can share
//! one Redis database. TTLs map to `PEXPIRE`, so expiry is enforced
//! server-side. Redis has no ordered key space, so `range_get` scans the
//! prefix with `SCAN`, filters the half-open range client-side, and sorts —
//! fine for the cursor/dedup/queue namespaces this store backs, which hold
//! at most a few thousand live keys per run.

use std::time::Duration;

use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{KeyValueStore, StoreError};

/// Connection settings for [`RedisKvStore`].
#[derive(Debug, Clone)]
pub struct RedisSettings {
    /// Redis host name.
    pub host: String,
    /// Redis port.
    pub port: u16,
    /// Database number.
    pub db: i64,
    /// Optional password.
    pub password: Option<String>,
    /// Prefix prepended to every key (e.g. `ocfetch:`).
    pub key_prefix: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 6379,
            db: 0,
            password: None,
            key_prefix: "ocfetch:".to_owned(),
        }
    }
}

impl RedisSettings {
    fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{password}@{host}:{port}/{db}",
                host = self.host,
                port = self.port,
                db = self.db
            ),
            None => format!(
                "redis://{host}:{port}/{db}",
                host = self.host,
                port = self.port,
                db = self.db
            ),
        }
    }
}

/// A Redis-backed [`KeyValueStore`].
pub struct RedisKvStore {
    conn: RwLock<Option<redis::aio::MultiplexedConnection>>,
    key_prefix: String,
}

impl RedisKvStore {
    /// Connect to Redis with the given settings.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the server cannot be reached.
    pub async fn connect(settings: &RedisSettings) -> Result<Self, StoreError> {
        let client = redis::Client::open(settings.url()).map_err(StoreError::unavailable)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(StoreError::unavailable)?;
        debug!(host = %settings.host, port = settings.port, db = settings.db, "connected to redis");
        Ok(Self {
            conn: RwLock::new(Some(conn)),
            key_prefix: settings.key_prefix.clone(),
        })
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        let guard = self.conn.read().await;
        guard.clone().ok_or_else(|| StoreError::Unavailable {
            reason: "store is closed".to_owned(),
        })
    }
}

#[async_trait::async_trait]
impl KeyValueStore for RedisKvStore {
    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let key = self.storage_key(key);
        match ttl {
            Some(ttl) => {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                conn.pset_ex::<_, _, ()>(key, value, millis)
                    .await
                    .map_err(StoreError::unavailable)?;
            }
            None => {
                conn.set::<_, _, ()>(key, value)
                    .await
                    .map_err(StoreError::unavailable)?;
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.connection().await?;
        conn.get::<_, Option<Vec<u8>>>(self.storage_key(key))
            .await
            .map_err(StoreError::unavailable)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn
            .del(self.storage_key(key))
            .await
            .map_err(StoreError::unavailable)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        conn.exists(self.storage_key(key))
            .await
            .map_err(StoreError::unavailable)
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

        let mut conn = self.connection().await?;

        // SCAN the shared prefix, then apply the [start, end) bound and sort
        // client-side to recover lexicographic order.
        let pattern = format!("{}*", self.key_prefix);
        let mut keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(&pattern)
                .await
                .map_err(StoreError::unavailable)?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        keys.sort_unstable();

        let mut entries = Vec::new();
        for storage_key in keys {
            let Some(key) = storage_key.strip_prefix(&self.key_prefix) else {
                continue;
            };
            if key < start_key {
                continue;
            }
            if let Some(end) = end_key {
                if key >= end {
                    continue;
                }
            }
            // A key can expire between SCAN and GET; skip it.
            let value: Option<Vec<u8>> = conn
                .get(&storage_key)
                .await
                .map_err(StoreError::unavailable)?;
            if let Some(value) = value {
                entries.push((key.to_owned(), value));
            }
            if let Some(limit) = limit {
                if entries.len() >= limit {
                    break;
                }
            }
        }
        Ok(entries)
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.conn.write().await;
        guard.take();
        Ok(())
    }
}

impl std::fmt::Debug for RedisKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKvStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}
