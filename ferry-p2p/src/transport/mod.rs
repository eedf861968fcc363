//! Transport seam.
//!
//! Pools, listeners and the manager only ever see a [`Transport`]: something
//! that dials or listens and hands back a [`Connection`], which is a fresh
//! [`PeerHandle`] plus the handshake that drives it. Two implementations
//! ship with the crate:
//!
//! - [`MemoryNetwork`]: an in-process simulated network for tests
//! - [`TcpTransport`]: plain TCP with a one-line JSON hello

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{P2pError, P2pResult};
use crate::peer::{DisconnectReason, PeerHandle, PeerState};

pub mod memory;
pub mod tcp;

pub use memory::{MemoryListener, MemoryNetwork, MemoryTransport, RemoteBehavior};
pub use tcp::{Hello, TcpTransport};

/// Dials and listens for peer connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open an outbound connection. The handshake has not run yet.
    async fn dial(&self, addr: SocketAddr) -> P2pResult<Connection>;

    /// Bind a listener on `addr`.
    async fn listen(&self, addr: SocketAddr) -> P2pResult<Box<dyn Listener>>;
}

/// A bound listen socket.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Address actually bound. Differs from the requested one for port 0.
    fn local_addr(&self) -> SocketAddr;

    /// Wait for the next inbound connection.
    async fn accept(&self) -> P2pResult<Connection>;
}

/// Drives a handle from `Connecting` to `Handshaked` or `Failed`.
#[async_trait]
pub trait Handshake: Send {
    async fn perform(self: Box<Self>) -> P2pResult<()>;
}

/// A connection whose handshake has not been performed.
pub struct Connection {
    pub handle: Arc<PeerHandle>,
    pub handshake: Box<dyn Handshake>,
}

impl Connection {
    pub fn new(handle: Arc<PeerHandle>, handshake: Box<dyn Handshake>) -> Self {
        Self { handle, handshake }
    }

    pub fn into_parts(self) -> (Arc<PeerHandle>, Box<dyn Handshake>) {
        (self.handle, self.handshake)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("handle", &self.handle).finish_non_exhaustive()
    }
}

/// Record `error` as the reason, move the handle to `Failed`, and return the error.
pub(crate) fn fail_handshake(handle: &Arc<PeerHandle>, error: P2pError) -> P2pError {
    handle.set_disconnect_reason(DisconnectReason::new(error.to_string()));
    handle.set_state(PeerState::Failed);
    error
}

/// Move a handle to `Handshaked`, failing if it was disconnected meanwhile.
pub(crate) fn complete_handshake(handle: &Arc<PeerHandle>) -> P2pResult<()> {
    if handle.set_state(PeerState::Handshaked) {
        Ok(())
    } else {
        Err(P2pError::HandshakeFailed(format!(
            "{} went {} during handshake",
            handle.addr(),
            handle.state()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ConnectionDirection;

    fn handle() -> Arc<PeerHandle> {
        PeerHandle::detached("10.0.0.1:9333".parse().unwrap(), ConnectionDirection::Outbound)
    }

    #[test]
    fn test_fail_handshake_sets_reason() {
        let peer = handle();
        peer.set_state(PeerState::HandshakeInProgress);

        let err = fail_handshake(&peer, P2pError::HandshakeTimeout);
        assert!(matches!(err, P2pError::HandshakeTimeout));
        assert_eq!(peer.state(), PeerState::Failed);
        assert_eq!(peer.disconnect_reason().unwrap().reason, "Handshake timeout");
    }

    #[test]
    fn test_complete_handshake_after_disconnect_fails() {
        let peer = handle();
        peer.disconnect("stopping").unwrap();

        assert!(matches!(
            complete_handshake(&peer),
            Err(P2pError::HandshakeFailed(_))
        ));
        assert_eq!(peer.state(), PeerState::Offline);
    }
}
