//! Error types for the key-value substrate.

/// Errors from key-value store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached. Retryable by the caller.
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    /// A stored value could not be decoded.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// The store was asked to do something it cannot (bad key, bad limit).
    #[error("invalid store request: {reason}")]
    InvalidRequest { reason: String },
}

impl StoreError {
    /// Build an [`StoreError::Unavailable`] from any displayable transport error.
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            reason: err.to_string(),
        }
    }
}
