// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the sync engine.
//!
//! Errors are categorized by their source (Postgres, the search cluster, the
//! watermark file, etc.) and carry the name of the operation that failed.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Source` | Mostly | Query/connection failures (decode errors are not retryable) |
//! | `Sink` | Depends | Transport, 5xx and 429 are retryable; other 4xx are not |
//! | `WatermarkStore` | No | State file unreadable or unwritable |
//! | `Config` | No | Configuration invalid |
//! | `UnknownQuery` | No | No query exists for the requested entity (programmer error) |
//! | `Decode` | No | Projection row does not match the document shape |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! [`retry()`](crate::resilience::retry) consults [`SyncError::is_retryable()`]:
//! retryable errors are retried with backoff, everything else is returned to
//! the caller immediately.

use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while synchronizing.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Postgres query or connection error.
    #[error("Source error ({operation}): {source}")]
    Source {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    /// Search cluster request failed.
    ///
    /// `status` is `None` for transport failures (connection refused, timeout).
    #[error("Sink error ({operation}): {message}")]
    Sink {
        operation: String,
        message: String,
        status: Option<u16>,
    },

    /// Watermark state could not be read or written.
    #[error("Watermark store error: {0}")]
    WatermarkStore(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A query was requested for an entity that has none.
    #[error("No query defined for {0}")]
    UnknownQuery(String),

    /// A projected row could not be decoded into a document.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a source error for the named operation.
    pub fn source(operation: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Source {
            operation: operation.into(),
            source,
        }
    }

    /// Create a sink error from a transport failure (no HTTP status).
    pub fn sink_transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sink {
            operation: operation.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Create a sink error from a non-success HTTP status.
    pub fn sink_status(operation: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Sink {
            operation: operation.into(),
            message: message.into(),
            status: Some(status),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Source { source, .. } => match source {
                // SQLSTATE 42xxx (syntax, undefined table/column) and 22xxx
                // (data exception) will fail the same way every time.
                sqlx::Error::Database(db_err) => !matches!(
                    db_err.code().as_deref().map(|c| &c[..c.len().min(2)]),
                    Some("42") | Some("22")
                ),
                sqlx::Error::ColumnDecode { .. }
                | sqlx::Error::ColumnNotFound(_)
                | sqlx::Error::ColumnIndexOutOfBounds { .. }
                | sqlx::Error::TypeNotFound { .. }
                | sqlx::Error::Decode(_)
                | sqlx::Error::Configuration(_) => false,
                _ => true,
            },
            Self::Sink { status, .. } => match status {
                None => true,
                Some(code) => *code == 429 || *code >= 500,
            },
            Self::WatermarkStore(_) => false,
            Self::Config(_) => false,
            Self::UnknownQuery(_) => false,
            Self::Decode(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
