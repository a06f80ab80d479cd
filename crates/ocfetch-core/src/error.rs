//! Error types for `ocfetch-core`.
//!
//! One enum per subsystem, so callers can match on the failures they can
//! actually handle, plus a top-level [`FetchError`] that folds everything
//! into the stable kind strings the structured logs and run results use.

use ocfetch_kv::StoreError;

/// Errors from configuration loading and component assembly.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable or setting is missing.
    #[error("missing required configuration: {name}")]
    Missing { name: String },

    /// A setting was present but could not be used.
    #[error("invalid configuration for {name}: {reason}")]
    Invalid { name: String, reason: String },

    /// A selector setting named a variant this build does not know.
    #[error("unknown {setting}: '{value}'")]
    UnknownVariant { setting: String, value: String },
}

/// Errors from parameter and data validation.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// A field failed validation.
    #[error("invalid {field}: {reason}")]
    Field { field: String, reason: String },

    /// A bundle reference failed validation (malformed BID, empty URL).
    #[error("invalid bundle ref: {reason}")]
    BundleRef { reason: String },
}

/// Errors from credential resolution.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The named credential key does not exist in the backend.
    #[error("credential key not found: {name}")]
    KeyMissing { name: String },

    /// The backend refused access to the secret.
    #[error("access denied to credential: {name}")]
    AccessDenied { name: String },

    /// The credential backend failed.
    #[error("credential backend error: {reason}")]
    Backend { reason: String },
}

/// Errors from the persistent work queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue namespace is unusable.
    #[error("invalid queue namespace: {reason}")]
    InvalidNamespace { reason: String },

    /// The backing key-value store failed.
    #[error("queue store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the notification publisher.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The publisher was constructed without a queue URL.
    #[error("notification queue URL is not configured")]
    MissingQueueUrl,

    /// Publishing the completion event failed.
    #[error("failed to publish completion notification: {reason}")]
    Publish { reason: String },
}

/// Errors from storage sinks and the bundle lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A filesystem operation failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A sink-specific operation failed (object store, archive, manifest).
    #[error("storage sink error: {reason}")]
    Sink { reason: String },

    /// An operation referenced a bundle the sink has not opened.
    #[error("bundle not open in storage: {bid}")]
    BundleNotOpen { bid: String },

    /// Sidecar or manifest serialization failed.
    #[error("storage serialization error: {reason}")]
    Serialization { reason: String },

    /// The completion notification failed after the sink finalized.
    #[error("storage notification error: {0}")]
    Notify(#[from] NotifyError),
}

/// Errors from bundle locators.
#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
    /// Retries exhausted; the cursor was not advanced. The scheduler keeps
    /// draining other locators and records the stall.
    #[error("locator '{locator_id}' stalled: {reason}")]
    Stalled { locator_id: String, reason: String },

    /// Persisted cursor state could not be read or written.
    #[error("locator cursor error: {reason}")]
    Cursor { reason: String },

    /// A protocol operation inside the locator failed.
    #[error("locator protocol error: {reason}")]
    Protocol { reason: String },

    /// The backing key-value store failed.
    #[error("locator store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from bundle loaders.
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// A network operation failed after retries.
    #[error("loader network error for {url}: {reason}")]
    Network { url: String, reason: String },

    /// The target resource is unusable (bad URL, missing file).
    #[error("loader resource error for {url}: {reason}")]
    Resource { url: String, reason: String },

    /// The storage lifecycle failed mid-bundle.
    #[error("loader storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from the strategy registry.
#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    /// No factory is registered under the requested name.
    #[error("unknown {kind} strategy: '{name}'")]
    Unknown { kind: String, name: String },

    /// A factory rejected its parameters. Names the offending field.
    #[error("invalid argument '{field}' for strategy '{strategy}': {reason}")]
    InvalidArgument {
        strategy: String,
        field: String,
        reason: String,
    },

    /// A factory produced an instance of the wrong kind.
    #[error("strategy '{name}' did not produce a {expected}")]
    WrongKind { name: String, expected: String },
}

/// Top-level error for fetch runs. Every variant maps to one of the stable
/// kind strings used in log records and `FetchResult` errors.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Locator(#[from] LocatorError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FetchError {
    /// Stable kind string for structured logging and error records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::Credential(_) => "configuration",
            Self::Validation(ValidationError::BundleRef { .. }) => "bundle_ref_validation",
            Self::Validation(_) | Self::Strategy(_) => "validation",
            Self::Queue(_) | Self::Storage(_) | Self::Notify(_) | Self::Store(_) => "storage",
            Self::Locator(LocatorError::Stalled { .. }) => "retryable",
            Self::Locator(_) => "resource",
            Self::Loader(LoaderError::Network { .. }) => "network",
            Self::Loader(LoaderError::Resource { .. }) => "resource",
            Self::Loader(LoaderError::Storage(_)) => "storage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        let err = FetchError::from(ConfigError::Missing {
            name: "OC_KV_STORE_TYPE".to_owned(),
        });
        assert_eq!(err.kind(), "configuration");

        let err = FetchError::from(ValidationError::BundleRef {
            reason: "empty primary url".to_owned(),
        });
        assert_eq!(err.kind(), "bundle_ref_validation");

        let err = FetchError::from(LocatorError::Stalled {
            locator_id: "fr-siren".to_owned(),
            reason: "retries exhausted".to_owned(),
        });
        assert_eq!(err.kind(), "retryable");

        let err = FetchError::from(LoaderError::Network {
            url: "http://mock/siren".to_owned(),
            reason: "timeout".to_owned(),
        });
        assert_eq!(err.kind(), "network");
    }
}
