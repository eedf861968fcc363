//! The set of currently handshaked peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::manager::bridge::BridgeFlags;
use crate::peer::PeerHandle;

/// A handshaked peer and the flags of the bridge that registered it.
#[derive(Debug, Clone)]
pub struct ConnectedPeer {
    pub handle: Arc<PeerHandle>,
    pub flags: BridgeFlags,
}

/// Thread-safe registry of connected peers, grouped by remote address.
///
/// Membership is per handle: two live connections to the same address are
/// both registered. Cloning shares the same registry.
#[derive(Debug, Clone, Default)]
pub struct ConnectedPeers {
    inner: Arc<Mutex<HashMap<SocketAddr, Vec<ConnectedPeer>>>>,
}

impl ConnectedPeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. Returns `false` if this handle is already present.
    pub fn add(&self, handle: &Arc<PeerHandle>, flags: BridgeFlags) -> bool {
        let mut peers = self.inner.lock();
        let entries = peers.entry(handle.addr()).or_default();
        if entries.iter().any(|entry| Arc::ptr_eq(&entry.handle, handle)) {
            return false;
        }
        entries.push(ConnectedPeer {
            handle: handle.clone(),
            flags,
        });
        true
    }

    /// Unregister a peer. Other handles to the same address stay; returns
    /// `false` if this handle was not registered.
    pub fn remove(&self, handle: &Arc<PeerHandle>) -> bool {
        let mut peers = self.inner.lock();
        let Some(entries) = peers.get_mut(&handle.addr()) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| !Arc::ptr_eq(&entry.handle, handle));
        let removed = entries.len() != before;
        if entries.is_empty() {
            peers.remove(&handle.addr());
        }
        removed
    }

    /// Check if any peer with this address is connected.
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.inner.lock().contains_key(addr)
    }

    /// Check if this exact handle is registered.
    pub fn contains_handle(&self, handle: &Arc<PeerHandle>) -> bool {
        self.inner
            .lock()
            .get(&handle.addr())
            .is_some_and(|entries| entries.iter().any(|entry| Arc::ptr_eq(&entry.handle, handle)))
    }

    /// The earliest registered peer at `addr`.
    pub fn get(&self, addr: &SocketAddr) -> Option<ConnectedPeer> {
        self.inner.lock().get(addr).and_then(|entries| entries.first().cloned())
    }

    /// Every registered peer at `addr`, oldest first.
    pub fn get_all(&self, addr: &SocketAddr) -> Vec<ConnectedPeer> {
        self.inner.lock().get(addr).cloned().unwrap_or_default()
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.inner.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Copy of the current entries, safe to iterate while peers come and go.
    pub fn snapshot(&self) -> Vec<ConnectedPeer> {
        self.inner.lock().values().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ConnectionDirection;

    fn handle(addr: &str) -> Arc<PeerHandle> {
        PeerHandle::detached(addr.parse().unwrap(), ConnectionDirection::Outbound)
    }

    #[test]
    fn test_add_is_idempotent() {
        let registry = ConnectedPeers::new();
        let peer = handle("10.0.0.1:9333");

        assert!(registry.add(&peer, BridgeFlags::default()));
        assert!(!registry.add(&peer, BridgeFlags::default()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ConnectedPeers::new();
        let peer = handle("10.0.0.1:9333");

        assert!(!registry.remove(&peer));
        registry.add(&peer, BridgeFlags::default());
        assert!(registry.remove(&peer));
        assert!(!registry.remove(&peer));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_ignores_other_handle_with_same_addr() {
        let registry = ConnectedPeers::new();
        let current = handle("10.0.0.1:9333");
        let stale = handle("10.0.0.1:9333");

        registry.add(&current, BridgeFlags::default());
        assert!(!registry.remove(&stale));
        assert!(registry.contains_handle(&current));
        assert!(!registry.contains_handle(&stale));
    }

    #[test]
    fn test_same_addr_handles_tracked_separately() {
        let registry = ConnectedPeers::new();
        let first = handle("10.0.0.1:9333");
        let second = handle("10.0.0.1:9333");

        assert!(registry.add(&first, BridgeFlags::default()));
        assert!(registry.add(&second, BridgeFlags::one_try()));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_all(&first.addr()).len(), 2);
        assert!(Arc::ptr_eq(&registry.get(&first.addr()).unwrap().handle, &first));

        assert!(registry.remove(&first));
        assert!(registry.contains_handle(&second));
        assert!(registry.contains(&second.addr()));
        assert_eq!(registry.snapshot().len(), 1);

        assert!(registry.remove(&second));
        assert!(registry.is_empty());
        assert!(!registry.contains(&second.addr()));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let registry = ConnectedPeers::new();
        let a = handle("10.0.0.1:9333");
        let b = handle("10.0.0.2:9333");
        registry.add(&a, BridgeFlags::default());
        registry.add(&b, BridgeFlags::default());

        let snapshot = registry.snapshot();
        for peer in &snapshot {
            registry.remove(&peer.handle);
        }

        assert_eq!(snapshot.len(), 2);
        assert!(registry.is_empty());
    }
}
