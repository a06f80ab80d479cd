//! HTTP protocol configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthenticationMechanism, Headers, NoAuthentication};

/// Settings for one HTTP endpoint family. Pools are keyed by
/// [`connection_key`](HttpProtocolConfig::connection_key), so configs that
/// agree on everything that affects connection behavior share a pool.
#[derive(Clone)]
pub struct HttpProtocolConfig {
    /// Request timeout.
    pub timeout: Duration,
    /// Default headers merged under request headers.
    pub default_headers: Headers,
    /// Requests per second through the pool's rate gate.
    pub rate_limit_requests_per_second: f64,
    /// Retry budget per request.
    pub max_retries: u32,
    /// Upper bound on live clients in the pool.
    pub pool_max_size: usize,
    /// Redirect hops to follow (zero disables redirects).
    pub max_redirects: usize,
    /// Authentication applied on every attempt.
    pub auth: Arc<dyn AuthenticationMechanism>,
}

impl Default for HttpProtocolConfig {
    fn default() -> Self {
        let mut default_headers = Headers::new();
        default_headers.insert("User-Agent".to_owned(), "ocfetch/0.3".to_owned());
        Self {
            timeout: Duration::from_secs(30),
            default_headers,
            rate_limit_requests_per_second: 10.0,
            max_retries: 3,
            pool_max_size: 5,
            max_redirects: 5,
            auth: Arc::new(NoAuthentication),
        }
    }
}

impl HttpProtocolConfig {
    /// Set the authentication mechanism.
    #[must_use]
    pub fn with_auth(mut self, auth: Arc<dyn AuthenticationMechanism>) -> Self {
        self.auth = auth;
        self
    }

    /// Fingerprint of everything that affects connection behavior:
    /// timeout, rate, retries, redirect cap, auth identity, and the sorted
    /// default headers.
    #[must_use]
    pub fn connection_key(&self) -> String {
        // Headers is a BTreeMap, so iteration order is already sorted.
        let headers: Vec<String> = self
            .default_headers
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!(
            "http|{}|{}|{}|{}|{}|{}",
            self.timeout.as_millis(),
            self.rate_limit_requests_per_second,
            self.max_retries,
            self.max_redirects,
            self.auth.identity(),
            headers.join(","),
        )
    }
}

impl std::fmt::Debug for HttpProtocolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProtocolConfig")
            .field("timeout", &self.timeout)
            .field("rate_limit_requests_per_second", &self.rate_limit_requests_per_second)
            .field("max_retries", &self.max_retries)
            .field("pool_max_size", &self.pool_max_size)
            .field("auth", &self.auth.identity())
            .finish_non_exhaustive()
    }
}
