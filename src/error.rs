//! Centralized error types for galsync.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the galsync library.
#[derive(Error, Debug)]
pub enum GalError {
    /// The caller is not allowed to use the requested GAL feature.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A structured search filter is missing a required part.
    #[error("invalid search filter: {0}")]
    InvalidFilter(String),

    /// A request carried an unusable argument.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The live directory search failed. This is the last fallback, so
    /// it is always surfaced to the caller.
    #[error("directory search failed: {reason}")]
    Directory { reason: String },

    /// A mailbox operation failed.
    #[error("mailbox error: {0}")]
    Mailbox(String),

    /// The change id presented is older than the mailbox change log.
    #[error("sync token too old, mailbox must resync")]
    MustResync,

    /// A mailbox item disappeared between listing and fetching it.
    #[error("no such item: {0}")]
    NoSuchItem(i32),

    /// A GAL configuration value is missing or malformed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A fixture file could not be parsed.
    #[error("invalid fixture '{path}': {reason}")]
    Fixture { path: PathBuf, reason: String },

    /// I/O error with the associated file path.
    #[error("I/O error reading '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias for `Result<T, GalError>`.
pub type Result<T> = std::result::Result<T, GalError>;

impl GalError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap any directory-side failure.
    pub fn directory(reason: impl std::fmt::Display) -> Self {
        Self::Directory {
            reason: reason.to_string(),
        }
    }
}
