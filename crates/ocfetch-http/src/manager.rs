//! HTTP connection manager.
//!
//! Owns one [`HttpConnectionPool`] per configuration fingerprint and hands
//! requests to the right pool. Shared by loaders and locators so that
//! everything talking to the same endpoint family shares its rate gate.

use std::collections::HashMap;
use std::sync::Arc;

use ocfetch_core::credentials::CredentialProvider;
use tokio::sync::RwLock;
use tracing::debug;

use crate::auth::Headers;
use crate::config::HttpProtocolConfig;
use crate::error::HttpError;
use crate::pool::HttpConnectionPool;

/// Pools keyed by configuration fingerprint.
#[derive(Default)]
pub struct HttpManager {
    pools: RwLock<HashMap<String, Arc<HttpConnectionPool>>>,
}

impl HttpManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The pool for a configuration, created on first use.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError`] if a fresh pool cannot be built.
    pub async fn pool_for(
        &self,
        config: &HttpProtocolConfig,
    ) -> Result<Arc<HttpConnectionPool>, HttpError> {
        let key = config.connection_key();
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(&key) {
                return Ok(Arc::clone(pool));
            }
        }

        let mut pools = self.pools.write().await;
        // Double-checked: another task may have created it meanwhile.
        if let Some(pool) = pools.get(&key) {
            return Ok(Arc::clone(pool));
        }
        debug!(key = %key, "creating http connection pool");
        let pool = Arc::new(HttpConnectionPool::new(config.clone())?);
        pools.insert(key, Arc::clone(&pool));
        Ok(pool)
    }

    /// Perform a request through the configuration's pool.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError`] from the pool's request path.
    pub async fn request(
        &self,
        config: &HttpProtocolConfig,
        provider: &Arc<dyn CredentialProvider>,
        method: reqwest::Method,
        url: &str,
        headers: &Headers,
    ) -> Result<reqwest::Response, HttpError> {
        let pool = self.pool_for(config).await?;
        pool.request(provider, method, url, headers).await
    }
}

impl std::fmt::Debug for HttpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_config_shares_a_pool() {
        let manager = HttpManager::new();
        let config = HttpProtocolConfig::default();

        let a = manager.pool_for(&config).await.unwrap();
        let b = manager.pool_for(&config).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn different_configs_get_distinct_pools() {
        let manager = HttpManager::new();
        let fast = HttpProtocolConfig::default();
        let slow = HttpProtocolConfig {
            rate_limit_requests_per_second: 1.0,
            ..HttpProtocolConfig::default()
        };

        let a = manager.pool_for(&fast).await.unwrap();
        let b = manager.pool_for(&slow).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
