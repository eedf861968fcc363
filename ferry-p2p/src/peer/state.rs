//! Peer lifecycle state machine.

use std::fmt;

/// Lifecycle state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PeerState {
    /// Connection created, transport not yet ready.
    #[default]
    Connecting,
    /// Hello exchange in progress.
    HandshakeInProgress,
    /// Handshake complete, peer is usable.
    Handshaked,
    /// Dial, handshake, or connection failed.
    Failed,
    /// Connection closed.
    Offline,
}

impl PeerState {
    /// Check if the peer has completed the handshake.
    pub fn is_handshaked(&self) -> bool {
        matches!(self, PeerState::Handshaked)
    }

    /// Check if the state is final. Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Failed | PeerState::Offline)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Connecting => write!(f, "connecting"),
            PeerState::HandshakeInProgress => write!(f, "handshake_in_progress"),
            PeerState::Handshaked => write!(f, "handshaked"),
            PeerState::Failed => write!(f, "failed"),
            PeerState::Offline => write!(f, "offline"),
        }
    }
}

/// A state transition delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    /// State before the transition.
    pub old: PeerState,
    /// State after the transition.
    pub new: PeerState,
}
