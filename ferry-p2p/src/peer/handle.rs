//! Shared handle to one peer connection.
//!
//! A [`PeerHandle`] is created by a transport when it dials or accepts a
//! connection. Everything else in the crate observes it: lifecycle bridges
//! and pools subscribe to its state changes, the bandwidth tracker reads its
//! byte counters, and owners disconnect it.
//!
//! State changes for one handle are delivered under a per-handle transition
//! lock, in the order they happen, and never twice for the same state.
//! Callbacks must not trigger a transition on the handle they are observing.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{P2pError, P2pResult};
use crate::peer::info::{ConnectionDirection, DisconnectReason, PeerVersion};
use crate::peer::state::{PeerState, StateChange};

/// Callback invoked on every state change of a handle.
pub type StateListener = Arc<dyn Fn(&Arc<PeerHandle>, StateChange) + Send + Sync>;

/// Commands sent from a handle to the transport task driving its I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    /// Close the connection.
    Disconnect,
}

/// Source of per-process unique handle ids.
static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Cumulative traffic counters.
#[derive(Debug, Default)]
struct ByteCounters {
    read: AtomicU64,
    written: AtomicU64,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, StateListener)>,
}

/// One network connection to another node.
pub struct PeerHandle {
    id: u64,
    addr: SocketAddr,
    direction: ConnectionDirection,
    state: Mutex<PeerState>,
    /// Serializes transitions and their delivery.
    transition: Mutex<()>,
    version: Mutex<Option<PeerVersion>>,
    disconnect_reason: Mutex<Option<DisconnectReason>>,
    counters: ByteCounters,
    listeners: Mutex<Listeners>,
    commands: Option<mpsc::UnboundedSender<PeerCommand>>,
}

impl PeerHandle {
    /// Create a handle whose I/O is driven by a task listening on `commands`.
    pub fn new(
        addr: SocketAddr,
        direction: ConnectionDirection,
        commands: mpsc::UnboundedSender<PeerCommand>,
    ) -> Arc<Self> {
        Arc::new(Self::build(addr, direction, Some(commands)))
    }

    /// Create a handle with no I/O task behind it.
    pub fn detached(addr: SocketAddr, direction: ConnectionDirection) -> Arc<Self> {
        Arc::new(Self::build(addr, direction, None))
    }

    fn build(
        addr: SocketAddr,
        direction: ConnectionDirection,
        commands: Option<mpsc::UnboundedSender<PeerCommand>>,
    ) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            direction,
            state: Mutex::new(PeerState::Connecting),
            transition: Mutex::new(()),
            version: Mutex::new(None),
            disconnect_reason: Mutex::new(None),
            counters: ByteCounters::default(),
            listeners: Mutex::new(Listeners::default()),
            commands,
        }
    }

    /// Unique id of this connection. Two handles to one address differ.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    pub fn is_inbound(&self) -> bool {
        self.direction.is_inbound()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    /// What the peer announced during the handshake, if it completed.
    pub fn version(&self) -> Option<PeerVersion> {
        self.version.lock().clone()
    }

    /// Why the connection ended, if known.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_reason.lock().clone()
    }

    /// Cumulative `(bytes_read, bytes_written)`.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.counters.read.load(Ordering::Relaxed),
            self.counters.written.load(Ordering::Relaxed),
        )
    }

    /// Record bytes received from the peer.
    pub fn record_read(&self, bytes: u64) {
        self.counters.read.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record bytes sent to the peer.
    pub fn record_written(&self, bytes: u64) {
        self.counters.written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Store the remote version. Called by transports before `Handshaked`.
    pub fn set_version(&self, version: PeerVersion) {
        *self.version.lock() = Some(version);
    }

    /// Store the disconnect reason. The first reason recorded wins.
    pub fn set_disconnect_reason(&self, reason: DisconnectReason) {
        let mut slot = self.disconnect_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    /// Subscribe to state changes. Dropping the returned token unsubscribes.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&Arc<PeerHandle>, StateChange) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));

        Subscription {
            handle: Arc::downgrade(self),
            id,
        }
    }

    /// Number of live subscriptions.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }

    fn unsubscribe(&self, id: u64) {
        self.listeners.lock().entries.retain(|(entry, _)| *entry != id);
    }

    /// Move to `new` and notify subscribers.
    ///
    /// Returns `false` without notifying if the handle is already in `new`
    /// or in a terminal state.
    pub fn set_state(self: &Arc<Self>, new: PeerState) -> bool {
        let _transition = self.transition.lock();

        let old = {
            let mut state = self.state.lock();
            if *state == new || state.is_terminal() {
                return false;
            }
            std::mem::replace(&mut *state, new)
        };

        tracing::trace!(addr = %self.addr, from = %old, to = %new, "Peer state transition");

        let listeners: Vec<StateListener> = self
            .listeners
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        let change = StateChange { old, new };
        for listener in listeners {
            listener(self, change);
        }

        true
    }

    /// Close the connection.
    ///
    /// The handle goes `Offline` immediately and the transport task is told
    /// to close the socket. Disconnecting a handle that already reached a
    /// terminal state is a no-op.
    pub fn disconnect(self: &Arc<Self>, reason: &str) -> P2pResult<()> {
        if self.state().is_terminal() {
            return Ok(());
        }

        self.set_disconnect_reason(DisconnectReason::new(reason));
        self.set_state(PeerState::Offline);

        match &self.commands {
            Some(tx) => tx.send(PeerCommand::Disconnect).map_err(|_| {
                P2pError::ChannelSend(format!("command channel to {} closed", self.addr))
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.addr, self.direction, self.state())
    }
}

/// Scoped registration of a state listener.
///
/// The listener stays registered exactly as long as this token lives.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    handle: Weak<PeerHandle>,
    id: u64,
}

impl Subscription {
    /// Unsubscribe now.
    pub fn release(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.upgrade() {
            handle.unsubscribe(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
