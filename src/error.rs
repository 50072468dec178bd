/// Unified error handling for rumbo
///
/// This module provides the error type surfaced by the cluster facade and
/// its collaborators. Topology-maintenance failures are never surfaced here;
/// they are recorded on the affected server's description instead.
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for cluster operations
#[derive(Debug, Error)]
pub enum Error {
    /// No eligible server was found before the caller's timeout elapsed
    #[error("server selection timed out after {elapsed:?}: {message}")]
    ServerSelectionTimeout { message: String, elapsed: Duration },

    /// Operation attempted after the cluster was disposed
    #[error("cluster has been closed")]
    ClusterClosed,

    /// Selection abandoned because the caller cancelled it
    #[error("server selection was cancelled")]
    SelectionCancelled,

    /// Network-level failure against an individual server
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    /// Malformed wire-level value during decode
    #[error("format error: {0}")]
    Format(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for cluster operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a server selection timeout error
    pub fn selection_timeout<S: Into<String>>(message: S, elapsed: Duration) -> Self {
        Error::ServerSelectionTimeout {
            message: message.into(),
            elapsed,
        }
    }

    /// Create a network error from a plain message
    pub fn network<S: Into<String>>(message: S) -> Self {
        Error::Network(io::Error::new(io::ErrorKind::Other, message.into()))
    }

    /// Create a format error
    pub fn format<S: Into<String>>(message: S) -> Self {
        Error::Format(message.into())
    }

    /// Check if this error is recoverable (safe to retry against another server)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::ServerSelectionTimeout { .. } => true,
            Error::ClusterClosed => false,
            Error::SelectionCancelled => false,
            Error::Format(_) => false,
            Error::Config(_) => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Error::Config(_) => ErrorSeverity::Critical,
            Error::ClusterClosed => ErrorSeverity::Error,
            Error::SelectionCancelled => ErrorSeverity::Warning,
            Error::ServerSelectionTimeout { .. } => ErrorSeverity::Warning,
            Error::Network(_) => ErrorSeverity::Warning,
            Error::Format(_) => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
        }
    }
}
