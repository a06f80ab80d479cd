//! SFTP protocol configuration.

use std::sync::Arc;
use std::time::Duration;

use ocfetch_core::strategy::GatingStrategy;

/// Settings for one SFTP endpoint. Pools are keyed by
/// [`connection_key`](SftpProtocolConfig::connection_key).
#[derive(Clone)]
pub struct SftpProtocolConfig {
    /// Credential configuration name (resolves host, port, username,
    /// password through the credential provider).
    pub config_name: String,
    /// Session establishment timeout.
    pub connect_timeout: Duration,
    /// Operations per second through the pool's rate gate.
    pub rate_limit_requests_per_second: f64,
    /// Retry budget per operation.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_retry_delay: Duration,
    /// Cap on any single retry delay.
    pub max_retry_delay: Duration,
    /// Backoff growth factor.
    pub retry_exponential_base: f64,
    /// Upper bound on live sessions in the pool.
    pub pool_max_size: usize,
    /// Baseline remote directory verified on acquire and release.
    pub base_dir: Option<String>,
    /// Optional gate checked before every operation (maintenance windows).
    pub gating: Option<Arc<dyn GatingStrategy>>,
}

impl SftpProtocolConfig {
    /// Create a config for a credential configuration name with defaults.
    #[must_use]
    pub fn new(config_name: impl Into<String>) -> Self {
        Self {
            config_name: config_name.into(),
            connect_timeout: Duration::from_secs(20),
            rate_limit_requests_per_second: 5.0,
            max_retries: 3,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            retry_exponential_base: 2.0,
            pool_max_size: 5,
            base_dir: None,
            gating: None,
        }
    }

    /// Set the baseline directory.
    #[must_use]
    pub fn with_base_dir(mut self, base_dir: impl Into<String>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }

    /// Fingerprint of everything that affects connection behavior.
    #[must_use]
    pub fn connection_key(&self) -> String {
        format!(
            "sftp|{}|{}|{}|{}|{}",
            self.config_name,
            self.connect_timeout.as_millis(),
            self.rate_limit_requests_per_second,
            self.max_retries,
            self.base_dir.as_deref().unwrap_or("-"),
        )
    }
}

impl std::fmt::Debug for SftpProtocolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpProtocolConfig")
            .field("config_name", &self.config_name)
            .field("connect_timeout", &self.connect_timeout)
            .field("rate_limit_requests_per_second", &self.rate_limit_requests_per_second)
            .field("max_retries", &self.max_retries)
            .field("pool_max_size", &self.pool_max_size)
            .field("base_dir", &self.base_dir)
            .finish_non_exhaustive()
    }
}
