//! Error types for the HTTP layer.

use ocfetch_core::error::{CredentialError, LoaderError, LocatorError};

/// Errors from HTTP pools, authentication, and requests.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// Credential resolution failed.
    #[error("http credential error: {0}")]
    Credential(#[from] CredentialError),

    /// An authentication mechanism could not produce headers.
    #[error("authentication failed: {reason}")]
    Auth { reason: String },

    /// The request could not be built or sent.
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    /// The server answered with a retryable or failing status after the
    /// retry budget was spent.
    #[error("request to {url} returned status {status}")]
    Status { url: String, status: u16 },
}

impl HttpError {
    /// The status code, when this error carries one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Map into a loader error for the given request URL.
    #[must_use]
    pub fn into_loader_error(self, url: &str) -> LoaderError {
        LoaderError::Network {
            url: url.to_owned(),
            reason: self.to_string(),
        }
    }

    /// Map into a locator error.
    #[must_use]
    pub fn into_locator_error(self) -> LocatorError {
        LocatorError::Protocol {
            reason: self.to_string(),
        }
    }
}
