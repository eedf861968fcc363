//! Outbound connection pools.
//!
//! A pool keeps up to `target` outbound connections open to addresses drawn
//! from its address book. The dial loop runs in its own task; every attempt
//! runs in a task of its own so one slow peer never holds up the rest.
//!
//! Lock order is slots, then address book. Handles are never called into
//! while the slots lock is held.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::addrman::{AddressBook, GroupSelector};
use crate::config::DEFAULT_RETRY_INTERVAL;
use crate::error::{P2pError, P2pResult};
use crate::manager::bridge::{BridgeFlags, BridgeTemplate, LifecycleBridge};
use crate::manager::registry::ConnectedPeers;
use crate::peer::{PeerHandle, PeerState, Subscription};
use crate::transport::Transport;

/// Which of the manager's pools this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Peers found through discovery.
    Discovered,
    /// The exclusive `connect` list.
    Connect,
    /// Peers added with `add_node`.
    AddNode,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Discovered => write!(f, "discovered"),
            PoolKind::Connect => write!(f, "connect"),
            PoolKind::AddNode => write!(f, "add_node"),
        }
    }
}

/// Pool parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub kind: PoolKind,
    pub selector: GroupSelector,
    /// Initial number of connections to maintain.
    pub target: usize,
    /// Flags stamped on every connection of the pool.
    pub flags: BridgeFlags,
    /// How often the dial loop re-checks for candidates on its own.
    pub retry_interval: Duration,
}

impl PoolConfig {
    pub fn new(kind: PoolKind, selector: GroupSelector, target: usize) -> Self {
        Self {
            kind,
            selector,
            target,
            flags: BridgeFlags::outbound(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_flags(mut self, flags: BridgeFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

/// A connection the pool is responsible for.
struct OwnedPeer {
    handle: Arc<PeerHandle>,
    _bridge: LifecycleBridge,
    _watch: Subscription,
}

#[derive(Default)]
struct Slots {
    owned: HashMap<SocketAddr, OwnedPeer>,
    connecting: HashSet<SocketAddr>,
}

impl Slots {
    fn occupied(&self) -> usize {
        self.owned.len() + self.connecting.len()
    }

    fn addresses(&self) -> HashSet<SocketAddr> {
        self.owned.keys().chain(self.connecting.iter()).copied().collect()
    }
}

struct PoolInner {
    kind: PoolKind,
    selector: GroupSelector,
    template: BridgeTemplate,
    retry_interval: Duration,
    book: Arc<AddressBook>,
    registry: ConnectedPeers,
    transport: Arc<dyn Transport>,
    target: AtomicUsize,
    slots: Mutex<Slots>,
    wake: Notify,
    shutdown: CancellationToken,
    started: AtomicBool,
}

/// A bounded set of outbound connections.
///
/// Dropping the pool cancels its dial loop without disconnecting anything;
/// call [`stop`](Self::stop) for an orderly teardown.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        book: Arc<AddressBook>,
        transport: Arc<dyn Transport>,
        registry: ConnectedPeers,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                kind: config.kind,
                selector: config.selector,
                template: BridgeTemplate::new(config.flags),
                retry_interval: config.retry_interval,
                book,
                registry,
                transport,
                target: AtomicUsize::new(config.target),
                slots: Mutex::new(Slots::default()),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn the dial loop. Returns `false` if it was already started.
    pub fn start(&self) -> bool {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return false;
        }

        tracing::debug!(
            pool = %self.inner.kind,
            selector = %self.inner.selector,
            target = self.target(),
            "Starting connection pool"
        );
        tokio::spawn(run_dial_loop(self.inner.clone()));
        true
    }

    /// Change the target by `delta`, saturating at zero. Returns the new target.
    pub fn adjust_target(&self, delta: isize) -> usize {
        let update = |target: usize| {
            Some(if delta < 0 {
                target.saturating_sub(delta.unsigned_abs())
            } else {
                target.saturating_add(delta.unsigned_abs())
            })
        };
        let previous = self
            .inner
            .target
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, update)
            .unwrap_or_else(|current| current);
        let target = update(previous).unwrap_or(previous);

        tracing::debug!(pool = %self.inner.kind, target, "Pool target changed");
        self.inner.wake.notify_one();
        target
    }

    /// Cancel the dial loop and disconnect every owned handle.
    ///
    /// Every handle is tried; failures are collected into one
    /// [`P2pError::Disposal`]. Stopping twice is a no-op.
    pub fn stop(&self) -> P2pResult<()> {
        self.inner.shutdown.cancel();

        let owned: Vec<OwnedPeer> = self.inner.slots.lock().owned.drain().map(|(_, p)| p).collect();
        if owned.is_empty() {
            return Ok(());
        }

        let mut failures = Vec::new();
        for peer in &owned {
            if let Err(e) = peer.handle.disconnect("connection pool stopped") {
                failures.push(format!("{}: {}", peer.handle.addr(), e));
            }
        }
        tracing::debug!(
            pool = %self.inner.kind,
            disconnected = owned.len(),
            failures = failures.len(),
            "Connection pool stopped"
        );

        P2pError::from_failures(failures)
    }

    pub fn kind(&self) -> PoolKind {
        self.inner.kind
    }

    pub fn selector(&self) -> GroupSelector {
        self.inner.selector
    }

    pub fn target(&self) -> usize {
        self.inner.target.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Connections dialed and not yet terminated, handshaked or not.
    pub fn owned_count(&self) -> usize {
        self.inner.slots.lock().owned.len()
    }

    /// Dials in flight.
    pub fn connecting_count(&self) -> usize {
        self.inner.slots.lock().connecting.len()
    }

    pub fn owned_peers(&self) -> Vec<Arc<PeerHandle>> {
        self.inner
            .slots
            .lock()
            .owned
            .values()
            .map(|p| p.handle.clone())
            .collect()
    }

    pub fn address_book(&self) -> &Arc<AddressBook> {
        &self.inner.book
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("kind", &self.inner.kind)
            .field("selector", &self.inner.selector)
            .field("target", &self.target())
            .field("owned", &self.owned_count())
            .field("connecting", &self.connecting_count())
            .finish()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl PoolInner {
    /// Start dials until owned plus connecting reaches the target.
    fn fill(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let target = self.target.load(Ordering::SeqCst);
        let mut slots = self.slots.lock();

        while slots.occupied() < target {
            let excluding = slots.addresses();
            let Some(addr) = self.selector.next_candidate(&self.book, &excluding) else {
                break;
            };

            slots.connecting.insert(addr);
            self.book.mark_attempt(&addr);
            tracing::debug!(pool = %self.kind, addr = %addr, "Dialing peer");
            tokio::spawn(connect(self.clone(), addr));
        }
    }

    fn finish_connecting(&self, addr: &SocketAddr) {
        self.slots.lock().connecting.remove(addr);
        self.wake.notify_one();
    }

    /// Free the slot held by `peer`, if it is still the owned handle.
    fn release(&self, peer: &Arc<PeerHandle>) {
        let removed = {
            let mut slots = self.slots.lock();
            match slots.owned.get(&peer.addr()) {
                Some(owned) if Arc::ptr_eq(&owned.handle, peer) => slots.owned.remove(&peer.addr()),
                _ => None,
            }
        };

        if removed.is_some() {
            tracing::debug!(pool = %self.kind, addr = %peer.addr(), "Pool slot released");
            self.wake.notify_one();
        }
    }
}

async fn run_dial_loop(inner: Arc<PoolInner>) {
    let mut retry = tokio::time::interval(inner.retry_interval);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        inner.fill();

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.wake.notified() => {}
            _ = retry.tick() => {}
        }
    }

    tracing::debug!(pool = %inner.kind, "Dial loop exited");
}

/// One dial plus handshake.
async fn connect(inner: Arc<PoolInner>, addr: SocketAddr) {
    let dialed = tokio::select! {
        _ = inner.shutdown.cancelled() => {
            inner.finish_connecting(&addr);
            return;
        }
        result = inner.transport.dial(addr) => result,
    };

    let (handle, handshake) = match dialed {
        Ok(connection) => connection.into_parts(),
        Err(e) => {
            tracing::debug!(pool = %inner.kind, addr = %addr, error = %e, "Dial failed");
            inner.book.mark_failed(&addr);
            inner.finish_connecting(&addr);
            return;
        }
    };

    let mut bridge = inner.template.bind(handle.clone(), inner.registry.clone());
    bridge.attach();

    let pool: Weak<PoolInner> = Arc::downgrade(&inner);
    let watch = handle.subscribe(move |peer, change| {
        if change.new.is_terminal() {
            if let Some(pool) = pool.upgrade() {
                pool.release(peer);
            }
        }
    });

    let rejected = {
        let mut slots = inner.slots.lock();
        slots.connecting.remove(&addr);
        let peer = OwnedPeer {
            handle: handle.clone(),
            _bridge: bridge,
            _watch: watch,
        };
        if inner.shutdown.is_cancelled() {
            Some(peer)
        } else {
            slots.owned.insert(addr, peer);
            None
        }
    };

    if let Some(peer) = rejected {
        if let Err(e) = peer.handle.disconnect("connection pool stopped") {
            tracing::debug!(pool = %inner.kind, addr = %addr, error = %e, "Disconnect failed");
        }
        return;
    }

    // Went away before the watcher could see it.
    if handle.state().is_terminal() {
        inner.release(&handle);
        return;
    }

    match handshake.perform().await {
        Ok(()) => {
            inner.book.mark_success(&addr);
        }
        Err(e) => {
            tracing::debug!(pool = %inner.kind, addr = %addr, error = %e, "Handshake failed");
            handle.set_state(PeerState::Failed);
            inner.book.mark_failed(&addr);
        }
    }
}
