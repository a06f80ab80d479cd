//! HTTP connection pool.
//!
//! Each pool owns an idle list of clients bounded by `pool_max_size`, a
//! rate-limit gate, and a retry engine. Acquire pops an idle client,
//! creates one while under the cap, or parks until a release. Every
//! request passes the rate gate (gate-entry times are monotonic per pool)
//! and runs inside the retry engine; authentication headers are re-applied
//! on each attempt so refreshed tokens are picked up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ocfetch_core::credentials::CredentialProvider;
use ocfetch_core::retry::{RetryConfig, RetryEngine};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::auth::Headers;
use crate::config::HttpProtocolConfig;
use crate::error::HttpError;

struct PoolState {
    idle: Vec<reqwest::Client>,
    total: usize,
}

/// A client pool for one HTTP configuration.
pub struct HttpConnectionPool {
    config: HttpProtocolConfig,
    state: Mutex<PoolState>,
    returned: Notify,
    /// Rate gate: instant of the last gate entry.
    gate: Mutex<Option<Instant>>,
    retry: RetryEngine,
}

impl HttpConnectionPool {
    /// Create a pool for the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Request`] when the retry policy or client
    /// settings are unusable.
    pub fn new(config: HttpProtocolConfig) -> Result<Self, HttpError> {
        let retry = RetryEngine::new(RetryConfig {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
            jitter_range: (0.5, 1.5),
        })
        .map_err(|e| HttpError::Request {
            url: String::new(),
            reason: format!("invalid retry policy: {e}"),
        })?;

        Ok(Self {
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
            }),
            returned: Notify::new(),
            gate: Mutex::new(None),
            retry,
        })
    }

    /// Create a pool with an explicit retry engine (tests use fast delays).
    #[must_use]
    pub fn with_retry(config: HttpProtocolConfig, retry: RetryEngine) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
            }),
            returned: Notify::new(),
            gate: Mutex::new(None),
            retry,
        }
    }

    /// The pool's configuration.
    #[must_use]
    pub fn config(&self) -> &HttpProtocolConfig {
        &self.config
    }

    fn build_client(&self) -> Result<reqwest::Client, HttpError> {
        let redirects = if self.config.max_redirects == 0 {
            reqwest::redirect::Policy::none()
        } else {
            reqwest::redirect::Policy::limited(self.config.max_redirects)
        };
        reqwest::Client::builder()
            .timeout(self.config.timeout)
            .redirect(redirects)
            .build()
            .map_err(|e| HttpError::Request {
                url: String::new(),
                reason: format!("client build failed: {e}"),
            })
    }

    /// Take a client: idle first, fresh while under the cap, otherwise wait
    /// for a release.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Request`] if a fresh client cannot be built.
    pub async fn acquire(&self) -> Result<reqwest::Client, HttpError> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(client) = state.idle.pop() {
                    return Ok(client);
                }
                if state.total < self.config.pool_max_size {
                    state.total += 1;
                    drop(state);
                    match self.build_client() {
                        Ok(client) => return Ok(client),
                        Err(err) => {
                            let mut state = self.state.lock().await;
                            state.total = state.total.saturating_sub(1);
                            drop(state);
                            self.returned.notify_one();
                            return Err(err);
                        }
                    }
                }
            }
            // At capacity: park until a client comes back.
            self.returned.notified().await;
        }
    }

    /// Return a client to the idle list.
    pub async fn release(&self, client: reqwest::Client) {
        let mut state = self.state.lock().await;
        state.idle.push(client);
        drop(state);
        self.returned.notify_one();
    }

    /// Discard a client instead of returning it.
    pub async fn discard(&self) {
        let mut state = self.state.lock().await;
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.returned.notify_one();
    }

    /// Enforce the pool rate: entries to the gate are at least
    /// `1 / rate_limit_requests_per_second` apart.
    async fn rate_gate(&self) {
        let min_interval = Duration::from_secs_f64(1.0 / self.config.rate_limit_requests_per_second);
        let mut gate = self.gate.lock().await;
        if let Some(last) = *gate {
            let since = last.elapsed();
            if since < min_interval {
                tokio::time::sleep(min_interval - since).await;
            }
        }
        *gate = Some(Instant::now());
    }

    /// Perform `method url` on a leased client: rate gate, retry engine,
    /// fresh auth headers per attempt. Server errors (5xx) and 429 are
    /// retried; other statuses are returned to the caller untouched.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError`] when transport fails or a retryable status
    /// outlives the retry budget.
    pub async fn request_with_client(
        &self,
        client: &reqwest::Client,
        provider: &Arc<dyn CredentialProvider>,
        method: reqwest::Method,
        url: &str,
        headers: &Headers,
    ) -> Result<reqwest::Response, HttpError> {
        self.retry
            .execute(|| {
                let client = client.clone();
                let method = method.clone();
                async move {
                    self.rate_gate().await;

                    // Default headers under request headers, auth on top —
                    // applied per attempt so token refreshes are honored.
                    let mut merged = self.config.default_headers.clone();
                    for (key, value) in headers {
                        merged.insert(key.clone(), value.clone());
                    }
                    self.config
                        .auth
                        .authenticate_request(&mut merged, provider)
                        .await?;

                    let mut request = client.request(method, url);
                    for (key, value) in &merged {
                        request = request.header(key, value);
                    }

                    let response = request.send().await.map_err(|e| HttpError::Request {
                        url: url.to_owned(),
                        reason: e.to_string(),
                    })?;

                    let status = response.status();
                    if status.is_server_error() || status.as_u16() == 429 {
                        debug!(url, status = status.as_u16(), "retryable response status");
                        return Err(HttpError::Status {
                            url: url.to_owned(),
                            status: status.as_u16(),
                        });
                    }
                    Ok(response)
                }
            })
            .await
    }

    /// Convenience: acquire, request, release.
    ///
    /// # Errors
    ///
    /// See [`request_with_client`](Self::request_with_client).
    pub async fn request(
        &self,
        provider: &Arc<dyn CredentialProvider>,
        method: reqwest::Method,
        url: &str,
        headers: &Headers,
    ) -> Result<reqwest::Response, HttpError> {
        let client = self.acquire().await?;
        let result = self
            .request_with_client(&client, provider, method, url, headers)
            .await;
        self.release(client).await;
        result
    }
}

impl std::fmt::Debug for HttpConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnectionPool")
            .field("key", &self.config.connection_key())
            .finish_non_exhaustive()
    }
}
