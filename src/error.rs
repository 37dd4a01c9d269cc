//! Error types for virtualization-mcp.
//!
//! `Error` is the internal error type threaded through the adapter, the
//! resource managers, and the handlers. The Dispatcher is the only place
//! that turns an `Error` into the client-visible envelope (see
//! `dispatch::envelope`); handlers never construct envelope JSON directly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using virtualization-mcp's `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The exhaustive, stable set of error kinds surfaced to MCP clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    AlreadyExists,
    InvalidState,
    Busy,
    PermissionDenied,
    Timeout,
    Cancelled,
    HostError,
    PoolExhausted,
    ConfigError,
    Unparseable,
    Internal,
}

impl ErrorKind {
    /// Whether an operation that failed with this kind is worth an automatic
    /// retry by a handler (see spec §5's retriable-operations whitelist).
    pub fn is_retriable(&self) -> bool {
        matches!(self, ErrorKind::Busy)
    }
}

/// Errors that can occur anywhere in virtualization-mcp.
#[derive(Error, Debug)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("timeout after {after_ms}ms: {operation}")]
    Timeout { after_ms: u64, operation: String },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("host error: {0}")]
    HostError(String),

    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("unparseable output from {operation}: {raw_excerpt}")]
    Unparseable { operation: String, raw_excerpt: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Map this error onto the stable, client-visible taxonomy (spec §6/§7).
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::Busy(_) => ErrorKind::Busy,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::HostError(_) => ErrorKind::HostError,
            Error::PoolExhausted(_) => ErrorKind::PoolExhausted,
            Error::ConfigError(_) => ErrorKind::ConfigError,
            Error::Unparseable { .. } => ErrorKind::Unparseable,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Io(_) => ErrorKind::HostError,
            Error::Serde(_) => ErrorKind::Internal,
        }
    }

    pub fn timeout(operation: impl Into<String>, after_ms: u64) -> Self {
        Error::Timeout {
            after_ms,
            operation: operation.into(),
        }
    }

    pub fn unparseable(operation: impl Into<String>, raw: &str) -> Self {
        let mut excerpt: String = raw.chars().take(400).collect();
        if raw.chars().count() > excerpt.chars().count() {
            excerpt.push_str("...");
        }
        Error::Unparseable {
            operation: operation.into(),
            raw_excerpt: excerpt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_is_retriable() {
        assert!(ErrorKind::Busy.is_retriable());
        assert!(!ErrorKind::NotFound.is_retriable());
    }

    #[test]
    fn unparseable_truncates_long_output() {
        let raw = "x".repeat(1000);
        let err = Error::unparseable("showvminfo", &raw);
        match err {
            Error::Unparseable { raw_excerpt, .. } => {
                assert!(raw_excerpt.len() < 1000);
                assert!(raw_excerpt.ends_with("..."));
            }
            _ => panic!("wrong variant"),
        }
    }
}
