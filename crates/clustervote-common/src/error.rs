//! Error taxonomy for clustervote
//!
//! Mirrors the disposition table of the system: configuration errors are
//! fatal at startup, certificate and connection errors are logged and
//! recovered from, protocol violations are dropped silently, and internal
//! invariant violations are fatal.

use thiserror::Error;

/// Result type alias using ClusterError
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Unified error type for clustervote operations
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Bad CLI index, unreadable files, unparseable key — fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Per-certificate parse failure or bad self-signature — logged, cert dropped
    #[error("certificate error: {reason}")]
    Certificate { reason: String },

    /// Dial failure, handshake failure, unexpected id, protocol mismatch
    #[error("connection error: {0}")]
    Connection(String),

    /// Mid-session read/write failure, treated as a disconnect
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Stale view, vote for wrong view, unknown message type — dropped with debug log
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Negative view, unreachable state — the process should terminate
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl ClusterError {
    /// True for errors the caller should treat as fatal to the whole process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClusterError::Config(_) | ClusterError::Internal(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_and_config_are_fatal() {
        assert!(ClusterError::Internal("view went negative".into()).is_fatal());
        assert!(ClusterError::Config("bad index".into()).is_fatal());
    }

    #[test]
    fn connection_and_protocol_are_not_fatal() {
        assert!(!ClusterError::Connection("dial timeout".into()).is_fatal());
        assert!(!ClusterError::Protocol("stale vote".into()).is_fatal());
    }
}
