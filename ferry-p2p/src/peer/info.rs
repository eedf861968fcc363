//! Peer metadata exchanged or observed over a connection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionDirection {
    /// We initiated the connection.
    Outbound,
    /// Peer connected to us.
    Inbound,
}

impl ConnectionDirection {
    /// Check if this is an inbound connection.
    pub fn is_inbound(&self) -> bool {
        matches!(self, ConnectionDirection::Inbound)
    }
}

impl fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDirection::Outbound => write!(f, "outbound"),
            ConnectionDirection::Inbound => write!(f, "inbound"),
        }
    }
}

/// What the remote peer announced about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerVersion {
    /// Remote software identifier.
    pub user_agent: String,
    /// Remote chain height at connection time.
    pub start_height: u64,
}

impl PeerVersion {
    pub fn new(user_agent: impl Into<String>, start_height: u64) -> Self {
        Self {
            user_agent: user_agent.into(),
            start_height,
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    /// Human-readable reason. May be empty.
    pub reason: String,
}

impl DisconnectReason {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The reason text, if there is any.
    pub fn text(&self) -> Option<&str> {
        if self.reason.is_empty() {
            None
        } else {
            Some(&self.reason)
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_display() {
        assert_eq!(ConnectionDirection::Inbound.to_string(), "inbound");
        assert_eq!(ConnectionDirection::Outbound.to_string(), "outbound");
        assert!(ConnectionDirection::Inbound.is_inbound());
    }

    #[test]
    fn test_empty_reason_has_no_text() {
        assert_eq!(DisconnectReason::new("").text(), None);
        assert_eq!(DisconnectReason::new("bye").text(), Some("bye"));
    }
}
