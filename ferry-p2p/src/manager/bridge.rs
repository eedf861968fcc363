//! Per-connection lifecycle bridge.
//!
//! A [`LifecycleBridge`] watches one peer handle and keeps the
//! [`ConnectedPeers`] registry in sync with it: a handshake registers the
//! peer, failure or disconnect unregisters it. Owners stamp bridges out of a
//! [`BridgeTemplate`] so every connection from one pool or listener carries
//! the same flags.

use std::fmt;
use std::sync::Arc;

use crate::manager::registry::ConnectedPeers;
use crate::peer::{PeerHandle, PeerState, StateChange, Subscription};

/// Flags fixed by the owner of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeFlags {
    /// Connection was accepted by a listener.
    pub inbound: bool,
    /// Peer is exempt from future policy decisions. Not enforced here.
    pub whitelisted: bool,
    /// Ad-hoc connection, force-disconnected at manager teardown.
    pub one_try: bool,
}

impl BridgeFlags {
    /// Flags for pool-managed outbound connections.
    pub fn outbound() -> Self {
        Self::default()
    }

    /// Flags for connections accepted on a listener.
    pub fn inbound(whitelisted: bool) -> Self {
        Self {
            inbound: true,
            whitelisted,
            one_try: false,
        }
    }

    /// Flags for an ad-hoc outbound connection.
    pub fn one_try() -> Self {
        Self {
            one_try: true,
            ..Self::default()
        }
    }

    fn direction(&self) -> &'static str {
        if self.inbound {
            "inbound"
        } else {
            "outbound"
        }
    }
}

/// Factory producing fresh, unattached bridges with shared flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeTemplate {
    flags: BridgeFlags,
}

impl BridgeTemplate {
    pub fn new(flags: BridgeFlags) -> Self {
        Self { flags }
    }

    pub fn flags(&self) -> BridgeFlags {
        self.flags
    }

    /// Create a bridge for `handle`. It is not attached yet.
    pub fn bind(&self, handle: Arc<PeerHandle>, registry: ConnectedPeers) -> LifecycleBridge {
        LifecycleBridge {
            flags: self.flags,
            handle,
            registry,
            subscription: None,
        }
    }
}

/// Observer tying one handle's lifecycle to the connected-peer registry.
///
/// Dropping the bridge detaches it.
pub struct LifecycleBridge {
    flags: BridgeFlags,
    handle: Arc<PeerHandle>,
    registry: ConnectedPeers,
    subscription: Option<Subscription>,
}

impl LifecycleBridge {
    /// Start observing the handle. Attaching twice is a no-op.
    pub fn attach(&mut self) {
        if self.subscription.is_some() {
            return;
        }

        let registry = self.registry.clone();
        let flags = self.flags;
        self.subscription = Some(
            self.handle
                .subscribe(move |peer, change| on_state_changed(&registry, flags, peer, change)),
        );
    }

    /// Stop observing the handle. The registry is left untouched.
    pub fn detach(&mut self) {
        self.subscription = None;
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn flags(&self) -> BridgeFlags {
        self.flags
    }

    pub fn handle(&self) -> &Arc<PeerHandle> {
        &self.handle
    }
}

impl fmt::Debug for LifecycleBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleBridge")
            .field("addr", &self.handle.addr())
            .field("flags", &self.flags)
            .field("attached", &self.is_attached())
            .finish()
    }
}

fn on_state_changed(
    registry: &ConnectedPeers,
    flags: BridgeFlags,
    peer: &Arc<PeerHandle>,
    change: StateChange,
) {
    match change.new {
        PeerState::Handshaked => {
            registry.add(peer, flags);

            let version = peer.version();
            let agent = version.as_ref().map_or("", |v| v.user_agent.as_str());
            let height = version.as_ref().map_or(0, |v| v.start_height);
            tracing::info!(
                addr = %peer.addr(),
                direction = flags.direction(),
                agent,
                height,
                "Peer connected"
            );
        }
        PeerState::Failed | PeerState::Offline => {
            tracing::info!(addr = %peer.addr(), state = %change.new, "Peer offline");
            if let Some(reason) = peer.disconnect_reason() {
                if let Some(text) = reason.text() {
                    tracing::info!(addr = %peer.addr(), reason = text, "Disconnect reason");
                }
            }
            registry.remove(peer);
        }
        PeerState::Connecting | PeerState::HandshakeInProgress => {}
    }
}
