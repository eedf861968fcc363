//! Connection manager.
//!
//! Owns the outbound pools, the inbound listeners, the connected-peer
//! registry and the bandwidth tracker. Exactly one of the discovery pool and
//! the connect-list pool exists, depending on whether a connect list is
//! configured; the add-node pool always exists.

pub mod bridge;
pub mod inbound;
pub mod pool;
pub mod registry;

use std::fmt;
use std::fmt::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::addrman::{AddressBook, GroupSelector};
use crate::config::{ConnmanConfig, ListenEndpoint};
use crate::error::{P2pError, P2pResult};
use crate::peer::{PeerHandle, PeerState, Subscription};
use crate::stats::BandwidthTracker;
use crate::transport::Transport;

pub use bridge::{BridgeFlags, BridgeTemplate, LifecycleBridge};
pub use inbound::InboundListener;
pub use pool::{ConnectionPool, PoolConfig, PoolKind};
pub use registry::{ConnectedPeer, ConnectedPeers};

/// Source recorded for addresses that come from local configuration.
const LOCAL_SOURCE: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Lifecycle of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Running,
    /// Terminal.
    Disposed,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerState::Uninitialized => write!(f, "uninitialized"),
            ManagerState::Running => write!(f, "running"),
            ManagerState::Disposed => write!(f, "disposed"),
        }
    }
}

enum Lifecycle {
    Uninitialized,
    /// `start` is binding listeners.
    Starting,
    Running { listeners: Vec<InboundListener> },
    Disposed,
}

/// An ad-hoc connection from [`ConnectionManager::connect`].
struct AdhocPeer {
    handle: Arc<PeerHandle>,
    _bridge: LifecycleBridge,
    _watch: Subscription,
}

#[derive(Default)]
struct AdhocPeers {
    closed: bool,
    peers: Vec<AdhocPeer>,
}

/// Top-level coordinator of a node's connections.
pub struct ConnectionManager {
    config: ConnmanConfig,
    transport: Arc<dyn Transport>,
    registry: ConnectedPeers,
    tracker: BandwidthTracker,
    discovered: Option<ConnectionPool>,
    connect: Option<ConnectionPool>,
    add_node: ConnectionPool,
    lifecycle: Mutex<Lifecycle>,
    adhoc: Arc<Mutex<AdhocPeers>>,
}

impl ConnectionManager {
    /// Validate `config` and build the pools. Nothing is dialed or bound
    /// until [`start`](Self::start).
    ///
    /// `discovery_book` feeds the discovery pool; it is unused when a connect
    /// list is configured.
    pub fn new(
        config: ConnmanConfig,
        transport: Arc<dyn Transport>,
        discovery_book: Arc<AddressBook>,
    ) -> P2pResult<Self> {
        config.validate()?;
        let registry = ConnectedPeers::new();

        let pool = |kind, selector, target, book| {
            let pool_config = PoolConfig::new(kind, selector, target)
                .with_retry_interval(config.retry_interval);
            ConnectionPool::new(pool_config, book, transport.clone(), registry.clone())
        };
        let isolated_book = |addrs: &[SocketAddr]| {
            Arc::new(AddressBook::with_addresses(
                addrs.iter().copied(),
                LOCAL_SOURCE,
                config.dial_backoff,
            ))
        };

        let (discovered, connect) = if config.uses_discovery() {
            let discovered = pool(
                PoolKind::Discovered,
                GroupSelector::ByNetwork,
                config.max_outbound,
                discovery_book,
            );
            (Some(discovered), None)
        } else {
            let connect = pool(
                PoolKind::Connect,
                GroupSelector::ByEndpoint,
                config.connect.len(),
                isolated_book(config.connect.as_slice()),
            );
            (None, Some(connect))
        };

        let add_node = pool(
            PoolKind::AddNode,
            GroupSelector::ByEndpoint,
            config.add_node.len(),
            isolated_book(config.add_node.as_slice()),
        );

        Ok(Self {
            config,
            transport,
            registry,
            tracker: BandwidthTracker::new(),
            discovered,
            connect,
            add_node,
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
            adhoc: Arc::new(Mutex::new(AdhocPeers::default())),
        })
    }

    /// Start the pools and bind every listen endpoint.
    ///
    /// A bind failure tears down whatever was already started and leaves
    /// the manager disposed.
    pub async fn start(&self) -> P2pResult<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Uninitialized => *lifecycle = Lifecycle::Starting,
                Lifecycle::Disposed => return Err(P2pError::NotRunning),
                Lifecycle::Starting | Lifecycle::Running { .. } => {
                    return Err(P2pError::InvalidState(
                        "connection manager already started".to_string(),
                    ))
                }
            }
        }

        for pool in self.pools() {
            pool.start();
        }

        let mut listeners = Vec::with_capacity(self.config.listen.len());
        for endpoint in &self.config.listen {
            match InboundListener::bind(*endpoint, &self.transport, self.registry.clone()).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    tracing::error!(addr = %endpoint.addr, error = %e, "Failed to bind listen endpoint");
                    *self.lifecycle.lock() = Lifecycle::Disposed;
                    warn_incomplete_teardown(&self.teardown(listeners));
                    return Err(e);
                }
            }
        }

        let bound: Vec<ListenEndpoint> = listeners.iter().map(|l| l.bound_endpoint()).collect();
        tracing::info!("{}", format_listen_summary(&bound));

        let mut lifecycle = self.lifecycle.lock();
        if matches!(*lifecycle, Lifecycle::Starting) {
            *lifecycle = Lifecycle::Running { listeners };
            Ok(())
        } else {
            drop(lifecycle);
            warn_incomplete_teardown(&close_listeners(&listeners));
            Err(P2pError::InvalidState(
                "connection manager disposed during start".to_string(),
            ))
        }
    }

    /// Add `endpoint` to the add-node pool and grow its target by one.
    ///
    /// The target grows on every call, even when the address book already
    /// knows the endpoint.
    pub fn add_node(&self, endpoint: SocketAddr) -> P2pResult<()> {
        if self.state() == ManagerState::Disposed {
            return Err(P2pError::NotRunning);
        }

        let added = self.add_node.address_book().add_address(endpoint, LOCAL_SOURCE);
        let target = self.add_node.adjust_target(1);
        tracing::debug!(addr = %endpoint, new_address = added, target, "Node added");
        Ok(())
    }

    /// Always fails: peers cannot be removed from the add-node pool.
    pub fn remove_node(&self, _endpoint: SocketAddr) -> P2pResult<()> {
        Err(P2pError::Unsupported("remove_node"))
    }

    /// Dial `endpoint` once and wait for the handshake.
    ///
    /// The connection belongs to no pool and is never redialed. It is
    /// force-disconnected when the manager is disposed.
    pub async fn connect(&self, endpoint: SocketAddr) -> P2pResult<Arc<PeerHandle>> {
        if self.state() == ManagerState::Disposed {
            return Err(P2pError::NotRunning);
        }

        tracing::debug!(addr = %endpoint, "Connecting to peer (one try)");
        let (handle, handshake) = self.transport.dial(endpoint).await?.into_parts();

        let mut bridge = BridgeTemplate::new(BridgeFlags::one_try())
            .bind(handle.clone(), self.registry.clone());
        bridge.attach();

        let adhoc: Weak<Mutex<AdhocPeers>> = Arc::downgrade(&self.adhoc);
        let watch = handle.subscribe(move |peer, change| {
            if change.new.is_terminal() {
                if let Some(adhoc) = adhoc.upgrade() {
                    release_adhoc(&adhoc, peer);
                }
            }
        });

        let rejected = {
            let mut adhoc = self.adhoc.lock();
            let peer = AdhocPeer {
                handle: handle.clone(),
                _bridge: bridge,
                _watch: watch,
            };
            if adhoc.closed {
                Some(peer)
            } else {
                adhoc.peers.push(peer);
                None
            }
        };

        if let Some(peer) = rejected {
            if let Err(e) = peer.handle.disconnect("connection manager disposed") {
                tracing::debug!(addr = %endpoint, error = %e, "Disconnect failed");
            }
            return Err(P2pError::NotRunning);
        }

        if let Err(e) = handshake.perform().await {
            tracing::debug!(addr = %endpoint, error = %e, "One-try handshake failed");
            handle.set_state(PeerState::Failed);
            return Err(e);
        }

        Ok(handle)
    }

    /// Bandwidth report over the currently connected peers.
    pub fn get_stats(&self) -> String {
        self.tracker.report(&self.registry.snapshot())
    }

    /// Stop every pool, close every listener, then disconnect every
    /// one-try connection.
    ///
    /// Teardown carries on past individual failures, which are returned
    /// together as [`P2pError::Disposal`]. Disposing twice is a no-op.
    pub fn dispose(&self) -> P2pResult<()> {
        let listeners = match std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Disposed) {
            Lifecycle::Disposed => return Ok(()),
            Lifecycle::Running { listeners } => listeners,
            Lifecycle::Uninitialized | Lifecycle::Starting => Vec::new(),
        };
        tracing::info!("Disposing connection manager");

        let failures = self.teardown(listeners);
        if !failures.is_empty() {
            tracing::warn!(count = failures.len(), "Connection manager disposed with failures");
        }
        P2pError::from_failures(failures)
    }

    pub fn state(&self) -> ManagerState {
        match *self.lifecycle.lock() {
            Lifecycle::Uninitialized | Lifecycle::Starting => ManagerState::Uninitialized,
            Lifecycle::Running { .. } => ManagerState::Running,
            Lifecycle::Disposed => ManagerState::Disposed,
        }
    }

    pub fn config(&self) -> &ConnmanConfig {
        &self.config
    }

    /// The registry of handshaked peers.
    pub fn connected_peers(&self) -> &ConnectedPeers {
        &self.registry
    }

    pub fn bandwidth(&self) -> &BandwidthTracker {
        &self.tracker
    }

    /// The discovery pool, present when no connect list is configured.
    pub fn discovered_pool(&self) -> Option<&ConnectionPool> {
        self.discovered.as_ref()
    }

    /// The connect-list pool, present when a connect list is configured.
    pub fn connect_pool(&self) -> Option<&ConnectionPool> {
        self.connect.as_ref()
    }

    pub fn add_node_pool(&self) -> &ConnectionPool {
        &self.add_node
    }

    /// Addresses the listeners are bound to. Empty unless running.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        match &*self.lifecycle.lock() {
            Lifecycle::Running { listeners } => listeners.iter().map(|l| l.local_addr()).collect(),
            _ => Vec::new(),
        }
    }

    fn pools(&self) -> impl Iterator<Item = &ConnectionPool> {
        self.discovered
            .iter()
            .chain(self.connect.iter())
            .chain(std::iter::once(&self.add_node))
    }

    /// Stop pools, close listeners, and disconnect one-try connections.
    fn teardown(&self, listeners: Vec<InboundListener>) -> Vec<String> {
        let mut failures = self.stop_pools();
        failures.extend(close_listeners(&listeners));
        drop(listeners);

        let adhoc = {
            let mut adhoc = self.adhoc.lock();
            adhoc.closed = true;
            std::mem::take(&mut adhoc.peers)
        };

        let mut one_try: Vec<Arc<PeerHandle>> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|peer| peer.flags.one_try)
            .map(|peer| peer.handle)
            .collect();
        for peer in &adhoc {
            if !one_try.iter().any(|h| Arc::ptr_eq(h, &peer.handle)) {
                one_try.push(peer.handle.clone());
            }
        }

        for handle in &one_try {
            if let Err(e) = handle.disconnect("connection manager disposed") {
                failures.push(format!("{}: {}", handle.addr(), e));
            }
        }
        drop(adhoc);

        failures
    }

    fn stop_pools(&self) -> Vec<String> {
        let mut failures = Vec::new();
        for pool in self.pools() {
            if let Err(e) = pool.stop() {
                failures.extend(e.into_failures());
            }
        }
        failures
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("connected", &self.registry.len())
            .field("discovered", &self.discovered)
            .field("connect", &self.connect)
            .field("add_node", &self.add_node)
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            tracing::warn!(error = %e, "Connection manager dropped with teardown failures");
        }
    }
}

fn close_listeners(listeners: &[InboundListener]) -> Vec<String> {
    let mut failures = Vec::new();
    for listener in listeners {
        if let Err(e) = listener.close() {
            failures.extend(e.into_failures());
        }
    }
    failures
}

/// Log what a teardown after an aborted start failed to disconnect.
/// Returns `true` if anything failed.
fn warn_incomplete_teardown(failures: &[String]) -> bool {
    if failures.is_empty() {
        return false;
    }
    tracing::warn!(failures = ?failures, "Teardown after failed start was incomplete");
    true
}

fn release_adhoc(adhoc: &Mutex<AdhocPeers>, peer: &Arc<PeerHandle>) {
    let removed: Vec<AdhocPeer> = {
        let mut adhoc = adhoc.lock();
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut adhoc.peers)
            .into_iter()
            .partition(|p| Arc::ptr_eq(&p.handle, peer));
        adhoc.peers = kept;
        gone
    };
    drop(removed);
}

/// The startup summary of bound listeners.
pub fn format_listen_summary(endpoints: &[ListenEndpoint]) -> String {
    let mut out = String::from("Node listening on:\n");
    for endpoint in endpoints {
        let _ = writeln!(out, "{endpoint}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerVersion;
    use crate::transport::MemoryNetwork;
    use std::time::{Duration, Instant};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn manager(network: &MemoryNetwork, config: ConnmanConfig) -> ConnectionManager {
        ConnectionManager::new(
            config,
            Arc::new(network.transport()),
            Arc::new(AddressBook::new(Duration::from_secs(10))),
        )
        .unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_listen_summary_format() {
        let summary = format_listen_summary(&[
            ListenEndpoint::new(addr("0.0.0.0:9333")),
            ListenEndpoint::whitelisted(addr("127.0.0.1:9334")),
        ]);
        assert_eq!(
            summary,
            "Node listening on:\n0.0.0.0:9333\n127.0.0.1:9334 (whitelisted)\n"
        );
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let network = MemoryNetwork::new();
        let config = ConnmanConfig::new().with_max_outbound(0);
        let result = ConnectionManager::new(
            config,
            Arc::new(network.transport()),
            Arc::new(AddressBook::new(Duration::from_secs(1))),
        );
        assert!(matches!(result, Err(P2pError::Configuration(_))));
    }

    #[test]
    fn test_discovery_xor_connect_pool() {
        let network = MemoryNetwork::new();

        let discovering = manager(&network, ConnmanConfig::new());
        assert!(discovering.discovered_pool().is_some());
        assert!(discovering.connect_pool().is_none());
        assert_eq!(discovering.discovered_pool().unwrap().selector(), GroupSelector::ByNetwork);

        let config = ConnmanConfig::new().with_connect(vec![addr("10.0.0.1:1"), addr("10.0.0.2:1")]);
        let connecting = manager(&network, config);
        assert!(connecting.discovered_pool().is_none());
        let pool = connecting.connect_pool().unwrap();
        assert_eq!(pool.target(), 2);
        assert_eq!(pool.selector(), GroupSelector::ByEndpoint);
        assert_eq!(
            pool.address_book().entry(&addr("10.0.0.1:1")).unwrap().source,
            LOCAL_SOURCE
        );
    }

    #[test]
    fn test_add_node_grows_target_every_call() {
        let network = MemoryNetwork::new();
        let manager = manager(&network, ConnmanConfig::new());
        let endpoint = addr("10.0.0.7:9333");

        manager.add_node(endpoint).unwrap();
        manager.add_node(endpoint).unwrap();

        let pool = manager.add_node_pool();
        assert_eq!(pool.target(), 2);
        assert_eq!(pool.address_book().len(), 1);
    }

    #[test]
    fn test_remove_node_unsupported() {
        let network = MemoryNetwork::new();
        let manager = manager(&network, ConnmanConfig::new());
        assert!(matches!(
            manager.remove_node(addr("10.0.0.7:9333")),
            Err(P2pError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let network = MemoryNetwork::new();
        let manager = manager(&network, ConnmanConfig::new());

        manager.start().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Running);
        assert!(matches!(manager.start().await, Err(P2pError::InvalidState(_))));

        manager.dispose().unwrap();
        assert!(matches!(manager.start().await, Err(P2pError::NotRunning)));
    }

    #[tokio::test]
    async fn test_bind_failure_disposes() {
        let network = MemoryNetwork::new();
        network.occupy(addr("127.0.0.1:9334"));
        let config = ConnmanConfig::new()
            .with_listen(ListenEndpoint::new(addr("127.0.0.1:9333")))
            .with_listen(ListenEndpoint::new(addr("127.0.0.1:9334")));
        let manager = manager(&network, config);

        assert!(matches!(manager.start().await, Err(P2pError::Bind { .. })));
        assert_eq!(manager.state(), ManagerState::Disposed);
        assert!(manager.add_node_pool().is_stopped());
    }

    #[tokio::test]
    async fn test_closing_listeners_reports_failures() {
        let network = MemoryNetwork::new();
        let transport: Arc<dyn Transport> = Arc::new(network.transport());
        let registry = ConnectedPeers::new();
        let listener = InboundListener::bind(
            ListenEndpoint::new(addr("127.0.0.1:9333")),
            &transport,
            registry.clone(),
        )
        .await
        .unwrap();

        let remote = addr("10.0.0.5:40001");
        network
            .inject_inbound(
                listener.local_addr(),
                remote,
                crate::transport::RemoteBehavior::Accept(PeerVersion::new("ferry:remote", 1)),
            )
            .unwrap();
        wait_until(|| registry.contains(&remote)).await;
        network.sever(&remote);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let failures = close_listeners(std::slice::from_ref(&listener));
        assert_eq!(failures.len(), 1);
        assert!(failures[0].starts_with("10.0.0.5:40001"));
        assert!(warn_incomplete_teardown(&failures));
        assert!(!warn_incomplete_teardown(&[]));
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        let network = MemoryNetwork::new();
        let manager = manager(&network, ConnmanConfig::new());
        manager.start().await.unwrap();

        let result = manager.connect(addr("10.0.0.9:9333")).await;
        assert!(matches!(result, Err(P2pError::Dial { .. })));
        assert!(manager.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_connect_then_dispose() {
        let network = MemoryNetwork::new();
        let remote = addr("10.0.0.9:9333");
        network.accept(remote, PeerVersion::new("ferry:remote", 5));
        let manager = manager(&network, ConnmanConfig::new());
        manager.start().await.unwrap();

        let handle = manager.connect(remote).await.unwrap();
        let entry = manager.connected_peers().get(&remote).unwrap();
        assert!(entry.flags.one_try);
        assert!(Arc::ptr_eq(&entry.handle, &handle));
        assert_eq!(manager.discovered_pool().unwrap().owned_count(), 0);

        manager.dispose().unwrap();
        assert_eq!(handle.state(), PeerState::Offline);
        assert!(manager.connected_peers().is_empty());

        manager.dispose().unwrap();
        assert!(matches!(manager.connect(remote).await, Err(P2pError::NotRunning)));
    }

    #[tokio::test]
    async fn test_connect_to_pool_owned_addr_registers_both() {
        let network = MemoryNetwork::new();
        let remote = addr("10.0.0.1:9333");
        network.accept(remote, PeerVersion::new("ferry:remote", 5));
        let manager = manager(&network, ConnmanConfig::new().with_connect(vec![remote]));
        manager.start().await.unwrap();

        let pool = manager.connect_pool().unwrap();
        wait_until(|| manager.connected_peers().len() == 1).await;
        let pooled = pool.owned_peers().remove(0);

        let adhoc = manager.connect(remote).await.unwrap();
        assert_eq!(adhoc.state(), PeerState::Handshaked);
        assert!(manager.connected_peers().contains_handle(&adhoc));
        assert!(manager.connected_peers().contains_handle(&pooled));
        assert_eq!(manager.connected_peers().get_all(&remote).len(), 2);

        pooled.disconnect("bye").unwrap();
        assert!(!manager.connected_peers().contains_handle(&pooled));
        assert!(manager.connected_peers().contains_handle(&adhoc));
        assert!(manager
            .connected_peers()
            .snapshot()
            .iter()
            .any(|peer| Arc::ptr_eq(&peer.handle, &adhoc)));

        manager.dispose().unwrap();
        assert_eq!(adhoc.state(), PeerState::Offline);
    }
}
