//! SFTP connection manager.
//!
//! One [`SftpConnectionPool`] per configuration fingerprint, shared by the
//! loader and locators of a recipe so they sit behind one rate gate.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::config::SftpProtocolConfig;
use crate::error::SftpError;
use crate::pool::SftpConnectionPool;
use crate::session::SftpConnector;

/// Pools keyed by configuration fingerprint.
pub struct SftpManager {
    connector: Arc<dyn SftpConnector>,
    pools: RwLock<HashMap<String, Arc<SftpConnectionPool>>>,
}

impl SftpManager {
    /// Create a manager over a connector.
    #[must_use]
    pub fn new(connector: Arc<dyn SftpConnector>) -> Self {
        Self {
            connector,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// The pool for a configuration, created on first use.
    ///
    /// # Errors
    ///
    /// Returns [`SftpError`] if a fresh pool cannot be built.
    pub async fn pool_for(
        &self,
        config: &SftpProtocolConfig,
    ) -> Result<Arc<SftpConnectionPool>, SftpError> {
        let key = config.connection_key();
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(&key) {
                return Ok(Arc::clone(pool));
            }
        }

        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get(&key) {
            return Ok(Arc::clone(pool));
        }
        debug!(key = %key, "creating sftp connection pool");
        let pool = Arc::new(SftpConnectionPool::new(
            config.clone(),
            Arc::clone(&self.connector),
        )?);
        pools.insert(key, Arc::clone(&pool));
        Ok(pool)
    }

    /// Close every pool's idle sessions.
    pub async fn close(&self) {
        let pools = self.pools.read().await;
        for pool in pools.values() {
            pool.close().await;
        }
    }
}

impl std::fmt::Debug for SftpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpManager").finish_non_exhaustive()
    }
}
