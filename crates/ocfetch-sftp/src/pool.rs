//! SFTP connection pool.
//!
//! Sessions are pooled per configuration with an upper bound on live
//! sessions. Acquire health-checks idle sessions (cheap canonicalize) and
//! verifies the baseline directory, discarding anything questionable;
//! release re-verifies both before returning a session to the idle list.
//! Every operation passes the optional gating strategy, then the rate
//! gate, then runs inside the retry engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ocfetch_core::credentials::CredentialProvider;
use ocfetch_core::retry::{RetryConfig, RetryEngine};
use ocfetch_core::storage::ResourceStream;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::config::SftpProtocolConfig;
use crate::error::SftpError;
use crate::session::{SftpConnector, SftpCredentials, SftpDirEntry, SftpFileStat, SftpSessionOps};

struct PoolState {
    idle: Vec<Box<dyn SftpSessionOps>>,
    total: usize,
}

/// A session pool for one SFTP configuration.
pub struct SftpConnectionPool {
    config: SftpProtocolConfig,
    connector: Arc<dyn SftpConnector>,
    state: Mutex<PoolState>,
    returned: Notify,
    gate: Mutex<Option<Instant>>,
    retry: RetryEngine,
}

impl SftpConnectionPool {
    /// Create a pool.
    ///
    /// # Errors
    ///
    /// Returns [`SftpError::Connect`] when the retry policy in the config
    /// is unusable.
    pub fn new(
        config: SftpProtocolConfig,
        connector: Arc<dyn SftpConnector>,
    ) -> Result<Self, SftpError> {
        let retry = RetryEngine::new(RetryConfig {
            max_retries: config.max_retries,
            base_delay: config.base_retry_delay,
            max_delay: config.max_retry_delay,
            exponential_base: config.retry_exponential_base,
            jitter: true,
            jitter_range: (0.5, 1.5),
        })
        .map_err(|e| SftpError::Connect {
            host: config.config_name.clone(),
            reason: format!("invalid retry policy: {e}"),
        })?;

        Ok(Self {
            config,
            connector,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
            }),
            returned: Notify::new(),
            gate: Mutex::new(None),
            retry,
        })
    }

    /// The pool's configuration.
    #[must_use]
    pub fn config(&self) -> &SftpProtocolConfig {
        &self.config
    }

    async fn rate_gate(&self) {
        let min_interval =
            Duration::from_secs_f64(1.0 / self.config.rate_limit_requests_per_second);
        let mut gate = self.gate.lock().await;
        if let Some(last) = *gate {
            let since = last.elapsed();
            if since < min_interval {
                tokio::time::sleep(min_interval - since).await;
            }
        }
        *gate = Some(Instant::now());
    }

    async fn wait_gates(&self) {
        if let Some(gating) = &self.config.gating {
            gating.wait_if_needed().await;
        }
    }

    /// Health-check a session via the cheapest protocol round trip.
    async fn healthy(session: &dyn SftpSessionOps) -> bool {
        session.canonicalize(".").await.is_ok()
    }

    /// Verify the baseline directory, when one is configured.
    async fn baseline_ok(&self, session: &dyn SftpSessionOps) -> bool {
        match &self.config.base_dir {
            Some(base_dir) => session.canonicalize(base_dir).await.is_ok(),
            None => true,
        }
    }

    async fn discard(&self, session: Box<dyn SftpSessionOps>) {
        session.close().await;
        let mut state = self.state.lock().await;
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.returned.notify_one();
    }

    async fn create_session(
        &self,
        provider: &Arc<dyn CredentialProvider>,
    ) -> Result<Box<dyn SftpSessionOps>, SftpError> {
        let credentials = SftpCredentials::resolve(&self.config.config_name, provider).await?;
        self.retry
            .execute(|| {
                let credentials = credentials.clone();
                async move { self.connector.connect(&credentials).await }
            })
            .await
    }

    /// Lease a session: idle first (health + baseline checked), fresh
    /// while under the cap, otherwise wait for a release.
    ///
    /// # Errors
    ///
    /// Returns [`SftpError`] when credentials cannot be resolved or a
    /// fresh session cannot be established after retries.
    pub async fn acquire(
        self: &Arc<Self>,
        provider: &Arc<dyn CredentialProvider>,
    ) -> Result<SftpConnection, SftpError> {
        loop {
            let popped = {
                let mut state = self.state.lock().await;
                state.idle.pop()
            };

            if let Some(session) = popped {
                if !Self::healthy(session.as_ref()).await {
                    warn!(config_name = %self.config.config_name, "discarding unhealthy idle session");
                    self.discard(session).await;
                    continue;
                }
                if !self.baseline_ok(session.as_ref()).await {
                    warn!(
                        config_name = %self.config.config_name,
                        base_dir = self.config.base_dir.as_deref().unwrap_or("-"),
                        "baseline directory unreachable, discarding session"
                    );
                    self.discard(session).await;
                    continue;
                }
                return Ok(SftpConnection {
                    pool: Arc::clone(self),
                    session: Some(session),
                });
            }

            let can_create = {
                let mut state = self.state.lock().await;
                if state.total < self.config.pool_max_size {
                    state.total += 1;
                    true
                } else {
                    false
                }
            };

            if can_create {
                match self.create_session(provider).await {
                    Ok(session) => {
                        if !self.baseline_ok(session.as_ref()).await {
                            let base_dir = self.config.base_dir.clone().unwrap_or_default();
                            self.discard(session).await;
                            return Err(SftpError::Operation {
                                path: base_dir,
                                reason: "baseline directory unreachable on fresh session"
                                    .to_owned(),
                            });
                        }
                        debug!(config_name = %self.config.config_name, "sftp session pooled");
                        return Ok(SftpConnection {
                            pool: Arc::clone(self),
                            session: Some(session),
                        });
                    }
                    Err(err) => {
                        let mut state = self.state.lock().await;
                        state.total = state.total.saturating_sub(1);
                        drop(state);
                        self.returned.notify_one();
                        return Err(err);
                    }
                }
            }

            // At capacity: park until a session comes back.
            self.returned.notified().await;
        }
    }

    async fn release_session(&self, session: Box<dyn SftpSessionOps>) {
        if self.baseline_ok(session.as_ref()).await && Self::healthy(session.as_ref()).await {
            let mut state = self.state.lock().await;
            state.idle.push(session);
            drop(state);
            self.returned.notify_one();
        } else {
            warn!(config_name = %self.config.config_name, "discarding session on release");
            self.discard(session).await;
        }
    }

    /// Close every idle session.
    pub async fn close(&self) {
        let idle = {
            let mut state = self.state.lock().await;
            let idle = std::mem::take(&mut state.idle);
            state.total = state.total.saturating_sub(idle.len());
            idle
        };
        for session in idle {
            session.close().await;
        }
        self.returned.notify_waiters();
    }
}

impl std::fmt::Debug for SftpConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpConnectionPool")
            .field("key", &self.config.connection_key())
            .finish_non_exhaustive()
    }
}

/// A leased SFTP session. Every operation goes through the pool's gating,
/// rate limit, and retry. Call [`release`](SftpConnection::release) to
/// return the session; a dropped lease discards it (the pool's total count
/// is reclaimed).
pub struct SftpConnection {
    pool: Arc<SftpConnectionPool>,
    session: Option<Box<dyn SftpSessionOps>>,
}

impl SftpConnection {
    fn session(&self) -> Result<&dyn SftpSessionOps, SftpError> {
        self.session.as_deref().ok_or(SftpError::Closed)
    }

    async fn gated<T, F, Fut>(&self, mut op: F) -> Result<T, SftpError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, SftpError>>,
    {
        self.pool
            .retry
            .execute(|| {
                let fut = op();
                async move {
                    self.pool.wait_gates().await;
                    self.pool.rate_gate().await;
                    fut.await
                }
            })
            .await
    }

    /// List a directory.
    ///
    /// # Errors
    ///
    /// Returns [`SftpError`] after the retry budget is spent.
    pub async fn list_dir(&self, path: &str) -> Result<Vec<SftpDirEntry>, SftpError> {
        self.gated(|| async move { self.session()?.list_dir(path).await }).await
    }

    /// Stat a path.
    ///
    /// # Errors
    ///
    /// Returns [`SftpError`] after the retry budget is spent.
    pub async fn stat(&self, path: &str) -> Result<SftpFileStat, SftpError> {
        self.gated(|| async move { self.session()?.stat(path).await }).await
    }

    /// Open a file for reading.
    ///
    /// # Errors
    ///
    /// Returns [`SftpError`] after the retry budget is spent.
    pub async fn open_read(&self, path: &str) -> Result<ResourceStream, SftpError> {
        self.gated(|| async move { self.session()?.open_read(path).await }).await
    }

    /// Whether a path exists.
    ///
    /// # Errors
    ///
    /// Returns [`SftpError`] after the retry budget is spent.
    pub async fn exists(&self, path: &str) -> Result<bool, SftpError> {
        self.gated(|| async move { self.session()?.exists(path).await }).await
    }

    /// Whether a path is a directory.
    ///
    /// # Errors
    ///
    /// Returns [`SftpError`] after the retry budget is spent.
    pub async fn is_dir(&self, path: &str) -> Result<bool, SftpError> {
        Ok(self.stat(path).await?.is_dir)
    }

    /// Whether a path is a regular file.
    ///
    /// # Errors
    ///
    /// Returns [`SftpError`] after the retry budget is spent.
    pub async fn is_file(&self, path: &str) -> Result<bool, SftpError> {
        Ok(self.stat(path).await?.is_file())
    }

    /// Return the session to the pool.
    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release_session(session).await;
        }
    }
}

impl Drop for SftpConnection {
    fn drop(&mut self) {
        // A lease dropped without release: reclaim the slot so the pool
        // does not leak capacity. The session itself is closed by the
        // remote side once the transport drops.
        if self.session.take().is_some() {
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move {
                let mut state = pool.state.lock().await;
                state.total = state.total.saturating_sub(1);
                drop(state);
                pool.returned.notify_one();
            });
        }
    }
}
