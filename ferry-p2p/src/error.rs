//! P2P error types.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Connection manager errors.
#[derive(Debug, Error)]
pub enum P2pError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid or inconsistent configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Failed to bind a listen endpoint. Fatal at startup.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Outbound dial failed (unreachable, refused).
    #[error("Failed to dial {addr}: {reason}")]
    Dial { addr: SocketAddr, reason: String },

    /// Connection timed out.
    #[error("Connection timeout to {addr}")]
    ConnectionTimeout { addr: SocketAddr },

    /// Handshake failed.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Handshake timed out.
    #[error("Handshake timeout")]
    HandshakeTimeout,

    /// Failed to serialize or deserialize a message.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation is not supported.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    /// One or more handles could not be disconnected during teardown.
    #[error("Disposal completed with {} failure(s): {}", failures.len(), failures.join("; "))]
    Disposal { failures: Vec<String> },

    /// Channel send error.
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Operation is not valid in the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The connection manager is not running.
    #[error("Connection manager is not running")]
    NotRunning,
}

impl P2pError {
    /// Build a disposal error from collected failures, or `Ok` if there were none.
    pub fn from_failures(failures: Vec<String>) -> P2pResult<()> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(P2pError::Disposal { failures })
        }
    }

    /// Flatten this error into disposal failure lines.
    pub fn into_failures(self) -> Vec<String> {
        match self {
            P2pError::Disposal { failures } => failures,
            other => vec![other.to_string()],
        }
    }
}

impl From<serde_json::Error> for P2pError {
    fn from(err: serde_json::Error) -> Self {
        P2pError::Serialization(err.to_string())
    }
}

/// Result type for P2P operations.
pub type P2pResult<T> = Result<T, P2pError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_failures() {
        assert!(P2pError::from_failures(Vec::new()).is_ok());

        let err = P2pError::from_failures(vec!["a".into(), "b".into()]).unwrap_err();
        assert_eq!(err.to_string(), "Disposal completed with 2 failure(s): a; b");
    }

    #[test]
    fn test_into_failures_flattens() {
        let nested = P2pError::Disposal {
            failures: vec!["x".into()],
        };
        assert_eq!(nested.into_failures(), vec!["x".to_string()]);

        let single = P2pError::ChannelSend("closed".into());
        assert_eq!(
            single.into_failures(),
            vec!["Channel send error: closed".to_string()]
        );
    }
}
