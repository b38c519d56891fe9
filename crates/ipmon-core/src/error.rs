//! Error types for ipmon
//!
//! This module defines all error types used throughout the crate.
//! Nothing here is fatal to the daemon: the refresh worker logs every
//! error and keeps running.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for ipmon operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for ipmon
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (usage errors at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors (sockets, files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Kernel routing socket errors
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// Interface enumeration failed
    #[error("Interface enumeration error: {0}")]
    Enumeration(String),

    /// One or more dry-run probes were rejected by the firewall engine
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// The firewall engine rejected a command
    #[error("Firewall engine error: {message}")]
    Firewall {
        /// Short description of the failed operation
        message: String,
        /// Captured diagnostic output of the engine, if any
        stderr: Option<String>,
        /// Exit status of the engine, if it ran to completion
        exit_code: Option<i32>,
    },

    /// An external call did not complete in time
    #[error("Timed out after {after:?}: {operation}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// The bound that was exceeded
        after: Duration,
    },

    /// Writing a generated file failed
    #[error("Failed to persist {path}: {message}")]
    Persist {
        /// Target path of the write
        path: String,
        /// Underlying reason
        message: String,
    },

    /// Control channel errors
    #[error("Control channel error: {0}")]
    Control(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a netlink error
    pub fn netlink(msg: impl Into<String>) -> Self {
        Self::Netlink(msg.into())
    }

    /// Create an interface enumeration error
    pub fn enumeration(msg: impl Into<String>) -> Self {
        Self::Enumeration(msg.into())
    }

    /// Create a firewall engine error without captured output
    pub fn firewall(msg: impl Into<String>) -> Self {
        Self::Firewall {
            message: msg.into(),
            stderr: None,
            exit_code: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create a persistence error
    pub fn persist(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Persist {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a control channel error
    pub fn control(msg: impl Into<String>) -> Self {
        Self::Control(msg.into())
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Netlink(_) | Self::Timeout { .. })
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_lists_every_probe() {
        let err = Error::Validation(vec!["probe a".into(), "probe b".into()]);
        assert_eq!(err.to_string(), "Validation failed: probe a; probe b");
    }

    #[test]
    fn timeout_message_keeps_sub_second_bounds() {
        let err = Error::timeout("nft --json", Duration::from_millis(250));
        assert_eq!(err.to_string(), "Timed out after 250ms: nft --json");

        let err = Error::timeout("nft -f", Duration::from_secs(10));
        assert_eq!(err.to_string(), "Timed out after 10s: nft -f");
    }

    #[test]
    fn transient_classification() {
        assert!(Error::timeout("nft --check", Duration::from_secs(10)).is_transient());
        assert!(Error::netlink("bind").is_transient());
        assert!(!Error::Validation(vec![]).is_transient());
        assert!(!Error::config("bad delay").is_transient());
    }
}
