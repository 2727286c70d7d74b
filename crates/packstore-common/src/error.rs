//! Error types for packstore
//!
//! This module defines the error taxonomy shared by the archive engine and
//! the HTTP layer, together with the status code each class maps to.

use thiserror::Error;

/// Common result type for packstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for packstore
#[derive(Debug, Error)]
pub enum Error {
    // Validation errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("content length mismatch: declared {declared} bytes, received {received} bytes")]
    LengthMismatch { declared: u64, received: u64 },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("range not satisfiable for object of {size} bytes")]
    RangeNotSatisfiable { size: u64 },

    // Lookup errors
    #[error("not found: {0}")]
    NotFound(String),

    // Contention
    #[error("timed out acquiring lock on {path}")]
    LockTimeout { path: String },

    // Integrity errors
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("unsupported record: {0}")]
    UnsupportedRecord(String),

    // Storage errors
    #[error("store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Get the HTTP status code for this error
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidRequest(_) | Self::LengthMismatch { .. } => 400,

            // 403 Forbidden
            Self::Forbidden(_) => 403,

            // 404 Not Found
            Self::NotFound(_) => 404,

            // 409 Conflict
            Self::Conflict(_) => 409,

            // 416 Range Not Satisfiable
            Self::RangeNotSatisfiable { .. } => 416,

            // 500 Internal Server Error
            Self::ChecksumMismatch { .. }
            | Self::MalformedRecord(_)
            | Self::UnsupportedRecord(_)
            | Self::Store(_)
            | Self::Io(_)
            | Self::Internal(_) => 500,

            // 503 Service Unavailable
            Self::LockTimeout { .. } | Self::Configuration(_) => 503,
        }
    }
}
