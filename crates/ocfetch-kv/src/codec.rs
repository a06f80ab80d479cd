//! Value codecs for typed access to the byte-oriented store.
//!
//! The store itself deals in opaque bytes; the queue and locator state pick
//! one of these encodings per namespace. JSON is the default (inspectable
//! with any Redis client), the binary codec is for hot namespaces where
//! payload size matters.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::StoreError;

/// Supported value encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// UTF-8 JSON via `serde_json`.
    #[default]
    Json,
    /// Compact binary via `bincode`.
    Binary,
}

impl Codec {
    /// Parse a codec name as used by `OC_KV_STORE_SERIALIZER`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRequest`] for unrecognized names.
    pub fn from_name(name: &str) -> Result<Self, StoreError> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "binary" | "bincode" => Ok(Self::Binary),
            other => Err(StoreError::InvalidRequest {
                reason: format!("unknown serializer '{other}' (expected 'json' or 'binary')"),
            }),
        }
    }

    /// Encode a value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the value cannot be encoded.
    pub fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StoreError> {
        match self {
            Self::Json => serde_json::to_vec(value).map_err(|e| StoreError::Serialization {
                reason: e.to_string(),
            }),
            Self::Binary => bincode::serialize(value).map_err(|e| StoreError::Serialization {
                reason: e.to_string(),
            }),
        }
    }

    /// Decode a value previously produced by [`dumps`](Codec::dumps).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the bytes do not decode.
    pub fn loads<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, StoreError> {
        match self {
            Self::Json => serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization {
                reason: e.to_string(),
            }),
            Self::Binary => bincode::deserialize(bytes).map_err(|e| StoreError::Serialization {
                reason: e.to_string(),
            }),
        }
    }
}
