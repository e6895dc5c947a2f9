//! Cache error taxonomy.
//!
//! Only `connect` failures and unconfirmed destructive operations are meant to
//! reach callers; everything else is contained by `CacheStore`.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to connect to cache store: {message}")]
    Connection { message: String },
    #[error("cache store is not connected")]
    NotConnected,
    #[error("cache operation `{op}` failed: {message}")]
    Operation { op: &'static str, message: String },
    #[error("cache operation `{op}` timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("refusing destructive operation `{op}` without explicit confirmation")]
    ConfirmationRequired { op: &'static str },
    #[error("invalid cache configuration: {message}")]
    InvalidConfig { message: String },
}

impl CacheError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn operation(op: &'static str, message: impl Into<String>) -> Self {
        Self::Operation {
            op,
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Errors that may succeed if the same call is repeated later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Operation { .. } | Self::NotConnected
        )
    }
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("failed to encode value as json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to encode value as binary: {0}")]
    Binary(#[from] bincode::Error),
    #[error("compression failed: {0}")]
    Compression(#[source] std::io::Error),
    #[error("decompression failed: {0}")]
    Decompression(#[source] std::io::Error),
    #[error("payload is missing an encoding tag")]
    MissingTag,
    #[error("payload is neither valid json ({json}) nor a binary object ({binary})")]
    Decode { json: String, binary: String },
}
