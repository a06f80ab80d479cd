//! Error types for the SFTP layer.

use ocfetch_core::error::{CredentialError, LoaderError, LocatorError};

/// Errors from SFTP connections and operations.
#[derive(Debug, thiserror::Error)]
pub enum SftpError {
    /// Credential resolution failed.
    #[error("sftp credential error: {0}")]
    Credential(#[from] CredentialError),

    /// The SSH/SFTP session could not be established.
    #[error("sftp connect to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    /// A remote operation failed.
    #[error("sftp operation on '{path}' failed: {reason}")]
    Operation { path: String, reason: String },

    /// The session is no longer usable.
    #[error("sftp session closed")]
    Closed,
}

impl SftpError {
    /// Shorthand for an operation failure.
    pub fn operation(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Operation {
            path: path.into(),
            reason: err.to_string(),
        }
    }

    /// Map into a locator stall (cursor untouched, other locators go on).
    #[must_use]
    pub fn into_locator_stall(self, locator_id: &str) -> LocatorError {
        LocatorError::Stalled {
            locator_id: locator_id.to_owned(),
            reason: self.to_string(),
        }
    }

    /// Map into a loader error for the given URL.
    #[must_use]
    pub fn into_loader_error(self, url: &str) -> LoaderError {
        LoaderError::Network {
            url: url.to_owned(),
            reason: self.to_string(),
        }
    }
}
