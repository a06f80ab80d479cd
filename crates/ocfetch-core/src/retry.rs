//! Exponential-backoff retry engine.
//!
//! Policy only: the engine decides how often and how long to wait, never
//! whether an error is worth retrying — callers wrap exactly the operations
//! they consider transient. Synchronous and asynchronous entry points have
//! identical semantics.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::ValidationError;

/// Retry policy parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Number of retries after the first attempt (`0` = no retries).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Growth factor per retry. Must be greater than one.
    pub exponential_base: f64,
    /// Whether to multiply each delay by a random factor.
    pub jitter: bool,
    /// Inclusive jitter factor range `(lo, hi)`, `0 < lo <= hi`.
    pub jitter_range: (f64, f64),
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            jitter_range: (0.5, 1.5),
        }
    }
}

impl RetryConfig {
    /// Validate the parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Field`] naming the offending field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let field = |field: &str, reason: &str| {
            Err(ValidationError::Field {
                field: field.to_owned(),
                reason: reason.to_owned(),
            })
        };
        if self.base_delay.is_zero() {
            return field("base_delay", "must be positive");
        }
        if self.max_delay.is_zero() {
            return field("max_delay", "must be positive");
        }
        if self.exponential_base <= 1.0 {
            return field("exponential_base", "must be greater than 1");
        }
        let (lo, hi) = self.jitter_range;
        if !(lo > 0.0 && lo <= hi) {
            return field("jitter_range", "requires 0 < lo <= hi");
        }
        Ok(())
    }
}

/// Executes operations under a [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryEngine {
    config: RetryConfig,
}

impl RetryEngine {
    /// Create an engine from a validated config.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the config is invalid.
    pub fn new(config: RetryConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// An engine with default policy except for the retry count.
    ///
    /// # Errors
    ///
    /// Never fails for any `max_retries`; kept fallible for uniformity with
    /// [`RetryEngine::new`].
    pub fn with_max_retries(max_retries: u32) -> Result<Self, ValidationError> {
        Self::new(RetryConfig {
            max_retries,
            ..RetryConfig::default()
        })
    }

    /// The active config.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry `attempt` (0-indexed):
    /// `min(base * exponential_base^attempt, max)`, multiplied by a factor
    /// drawn uniformly from the jitter range when jitter is enabled.
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .exponential_base
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let raw = self.config.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.config.max_delay.as_secs_f64());
        let factor = if self.config.jitter {
            let (lo, hi) = self.config.jitter_range;
            rand::thread_rng().gen_range(lo..=hi)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * factor)
    }

    /// Run an async operation, retrying on failure. The underlying
    /// operation is invoked at most `max_retries + 1` times; the last error
    /// is surfaced unchanged.
    ///
    /// # Errors
    ///
    /// Returns the final error produced by `op` once retries are exhausted.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.config.max_retries {
                        return Err(err);
                    }
                    let delay = self.calculate_delay(attempt);
                    debug!(
                        attempt = attempt + 1,
                        max = self.config.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Synchronous twin of [`execute`](RetryEngine::execute).
    ///
    /// # Errors
    ///
    /// Returns the final error produced by `op` once retries are exhausted.
    pub fn execute_sync<T, E, F>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: std::fmt::Display,
    {
        let mut attempt: u32 = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.config.max_retries {
                        return Err(err);
                    }
                    let delay = self.calculate_delay(attempt);
                    debug!(
                        attempt = attempt + 1,
                        max = self.config.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "operation failed, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// Conservative policy for establishing connections.
///
/// # Errors
///
/// Never fails; kept fallible for uniformity.
pub fn connection_retry_engine() -> Result<RetryEngine, ValidationError> {
    RetryEngine::new(RetryConfig {
        max_retries: 3,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
        exponential_base: 2.0,
        jitter: true,
        jitter_range: (0.5, 1.5),
    })
}

/// Snappier policy for per-request operations.
///
/// # Errors
///
/// Never fails; kept fallible for uniformity.
pub fn operation_retry_engine() -> Result<RetryEngine, ValidationError> {
    RetryEngine::new(RetryConfig {
        max_retries: 3,
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(30),
        exponential_base: 2.0,
        jitter: true,
        jitter_range: (0.5, 1.5),
    })
}
