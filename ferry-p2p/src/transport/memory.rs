//! In-process simulated network.
//!
//! Remote endpoints are registered on a [`MemoryNetwork`] with a
//! [`RemoteBehavior`]; dialing anything else fails as unreachable. Every
//! handle the network creates gets a small driver task standing in for the
//! socket, and the network keeps a record of those handles so tests can bump
//! their counters, close the remote side, or sever the command channel.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::error::{P2pError, P2pResult};
use crate::peer::{
    ConnectionDirection, DisconnectReason, PeerCommand, PeerHandle, PeerState, PeerVersion,
};
use crate::transport::{
    complete_handshake, fail_handshake, Connection, Handshake, Listener, Transport,
};

/// First port handed out for listeners bound to port 0.
const EPHEMERAL_PORT_START: u16 = 40000;

/// How a simulated remote endpoint answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteBehavior {
    /// Complete the handshake, announcing `version`.
    Accept(PeerVersion),
    /// Refuse the handshake with a reason.
    RejectHandshake(String),
    /// Never answer. The handshake ends only when the handle is disconnected.
    Stall,
}

/// Signals from the network to a handle's driver task.
#[derive(Debug)]
enum Control {
    /// The remote side hung up.
    CloseRemote,
    /// Exit without touching the handle, dropping the command receiver.
    Sever,
}

struct SimulatedPeer {
    handle: Arc<PeerHandle>,
    control: mpsc::UnboundedSender<Control>,
}

#[derive(Default)]
struct NetworkInner {
    remotes: HashMap<SocketAddr, RemoteBehavior>,
    listeners: HashMap<SocketAddr, mpsc::UnboundedSender<Connection>>,
    occupied: HashSet<SocketAddr>,
    peers: HashMap<SocketAddr, Vec<SimulatedPeer>>,
    dials: HashMap<SocketAddr, usize>,
    next_port: u16,
}

/// Shared simulated network. Cloning shares the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport attached to this network.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
        }
    }

    /// Register or replace the behavior of a remote endpoint.
    pub fn register(&self, addr: SocketAddr, behavior: RemoteBehavior) {
        self.inner.lock().remotes.insert(addr, behavior);
    }

    /// Register an endpoint that completes handshakes.
    pub fn accept(&self, addr: SocketAddr, version: PeerVersion) {
        self.register(addr, RemoteBehavior::Accept(version));
    }

    /// Register an endpoint that refuses handshakes.
    pub fn reject_handshake(&self, addr: SocketAddr, reason: impl Into<String>) {
        self.register(addr, RemoteBehavior::RejectHandshake(reason.into()));
    }

    /// Make an endpoint unreachable again.
    pub fn unregister(&self, addr: &SocketAddr) {
        self.inner.lock().remotes.remove(addr);
    }

    /// Mark an address as in use so binding it fails.
    pub fn occupy(&self, addr: SocketAddr) {
        self.inner.lock().occupied.insert(addr);
    }

    /// Number of dials made to `addr`.
    pub fn dial_count(&self, addr: &SocketAddr) -> usize {
        self.inner.lock().dials.get(addr).copied().unwrap_or(0)
    }

    /// Every handle created for `addr`, oldest first.
    pub fn handles(&self, addr: &SocketAddr) -> Vec<Arc<PeerHandle>> {
        self.inner
            .lock()
            .peers
            .get(addr)
            .map(|peers| peers.iter().map(|p| p.handle.clone()).collect())
            .unwrap_or_default()
    }

    /// The most recently created handle for `addr`.
    pub fn latest(&self, addr: &SocketAddr) -> Option<Arc<PeerHandle>> {
        self.inner
            .lock()
            .peers
            .get(addr)
            .and_then(|peers| peers.last())
            .map(|p| p.handle.clone())
    }

    /// Add traffic to the latest handle for `addr`.
    pub fn record_traffic(&self, addr: &SocketAddr, read: u64, written: u64) -> bool {
        match self.latest(addr) {
            Some(handle) => {
                handle.record_read(read);
                handle.record_written(written);
                true
            }
            None => false,
        }
    }

    /// Hang up the remote side of the latest connection to `addr`.
    pub fn close_remote(&self, addr: &SocketAddr) -> bool {
        self.send_control(addr, Control::CloseRemote)
    }

    /// Kill the driver of the latest connection to `addr` so that a later
    /// disconnect cannot reach it.
    pub fn sever(&self, addr: &SocketAddr) -> bool {
        self.send_control(addr, Control::Sever)
    }

    fn send_control(&self, addr: &SocketAddr, control: Control) -> bool {
        self.inner
            .lock()
            .peers
            .get(addr)
            .and_then(|peers| peers.last())
            .is_some_and(|p| p.control.send(control).is_ok())
    }

    /// Push an inbound connection from `remote` into the listener bound on
    /// `listen`. Must be called from within a Tokio runtime.
    pub fn inject_inbound(
        &self,
        listen: SocketAddr,
        remote: SocketAddr,
        behavior: RemoteBehavior,
    ) -> P2pResult<Arc<PeerHandle>> {
        let sender = self
            .inner
            .lock()
            .listeners
            .get(&listen)
            .cloned()
            .ok_or_else(|| P2pError::InvalidState(format!("nothing listening on {listen}")))?;

        let connection = self.open(remote, ConnectionDirection::Inbound, behavior);
        let handle = connection.handle.clone();
        sender
            .send(connection)
            .map_err(|_| P2pError::ChannelSend(format!("listener on {listen} closed")))?;
        Ok(handle)
    }

    /// Create a handle for `remote`, spawn its driver and record it.
    fn open(
        &self,
        remote: SocketAddr,
        direction: ConnectionDirection,
        behavior: RemoteBehavior,
    ) -> Connection {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let handle = PeerHandle::new(remote, direction, command_tx);

        tokio::spawn(drive(handle.clone(), command_rx, control_rx));

        self.inner
            .lock()
            .peers
            .entry(remote)
            .or_default()
            .push(SimulatedPeer {
                handle: handle.clone(),
                control: control_tx,
            });

        let handshake = MemoryHandshake {
            handle: handle.clone(),
            behavior,
        };
        Connection::new(handle, Box::new(handshake))
    }

    fn bind(&self, requested: SocketAddr) -> P2pResult<MemoryListener> {
        let mut inner = self.inner.lock();

        let addr = if requested.port() == 0 {
            if inner.next_port == 0 {
                inner.next_port = EPHEMERAL_PORT_START;
            }
            let port = inner.next_port;
            inner.next_port = inner.next_port.wrapping_add(1);
            SocketAddr::new(requested.ip(), port)
        } else {
            requested
        };

        if inner.occupied.contains(&addr) || inner.listeners.contains_key(&addr) {
            return Err(P2pError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} already in use"),
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        inner.listeners.insert(addr, tx);

        Ok(MemoryListener {
            addr,
            incoming: tokio::sync::Mutex::new(rx),
            network: self.clone(),
        })
    }
}

/// Stand-in for the socket task of one simulated connection.
async fn drive(
    handle: Arc<PeerHandle>,
    mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PeerCommand::Disconnect) | None => return,
            },
            signal = control.recv() => match signal {
                Some(Control::CloseRemote) => {
                    handle.set_disconnect_reason(DisconnectReason::new("remote closed connection"));
                    handle.set_state(PeerState::Offline);
                    return;
                }
                Some(Control::Sever) => return,
                None => break,
            },
        }
    }

    // Network dropped: keep serving commands until disconnect.
    while let Some(command) = commands.recv().await {
        match command {
            PeerCommand::Disconnect => return,
        }
    }
}

struct MemoryHandshake {
    handle: Arc<PeerHandle>,
    behavior: RemoteBehavior,
}

#[async_trait]
impl Handshake for MemoryHandshake {
    async fn perform(self: Box<Self>) -> P2pResult<()> {
        let MemoryHandshake { handle, behavior } = *self;
        handle.set_state(PeerState::HandshakeInProgress);

        match behavior {
            RemoteBehavior::Accept(version) => {
                handle.set_version(version);
                complete_handshake(&handle)
            }
            RemoteBehavior::RejectHandshake(reason) => {
                Err(fail_handshake(&handle, P2pError::HandshakeFailed(reason)))
            }
            RemoteBehavior::Stall => {
                let ended = Arc::new(Notify::new());
                let signal = ended.clone();
                let _watch = handle.subscribe(move |_, change| {
                    if change.new.is_terminal() {
                        signal.notify_one();
                    }
                });
                if !handle.state().is_terminal() {
                    ended.notified().await;
                }
                Err(P2pError::HandshakeFailed(format!(
                    "{} disconnected during handshake",
                    handle.addr()
                )))
            }
        }
    }
}

/// [`Transport`] over a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn new(network: MemoryNetwork) -> Self {
        Self { network }
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, addr: SocketAddr) -> P2pResult<Connection> {
        let behavior = {
            let mut inner = self.network.inner.lock();
            *inner.dials.entry(addr).or_default() += 1;
            inner.remotes.get(&addr).cloned()
        };

        match behavior {
            Some(behavior) => Ok(self.network.open(addr, ConnectionDirection::Outbound, behavior)),
            None => Err(P2pError::Dial {
                addr,
                reason: "unreachable".to_string(),
            }),
        }
    }

    async fn listen(&self, addr: SocketAddr) -> P2pResult<Box<dyn Listener>> {
        Ok(Box::new(self.network.bind(addr)?))
    }
}

/// Listener bound on a [`MemoryNetwork`]. Unbinds when dropped.
pub struct MemoryListener {
    addr: SocketAddr,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Connection>>,
    network: MemoryNetwork,
}

#[async_trait]
impl Listener for MemoryListener {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn accept(&self) -> P2pResult<Connection> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| P2pError::InvalidState(format!("listener on {} closed", self.addr)))
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.inner.lock().listeners.remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_unregistered_endpoint_is_unreachable() {
        let network = MemoryNetwork::new();
        let transport = network.transport();

        let err = transport.dial(addr("10.0.0.1:9333")).await.unwrap_err();
        assert!(matches!(err, P2pError::Dial { .. }));
        assert_eq!(network.dial_count(&addr("10.0.0.1:9333")), 1);
    }

    #[tokio::test]
    async fn test_accepting_endpoint_handshakes() {
        let network = MemoryNetwork::new();
        let remote = addr("10.0.0.1:9333");
        network.accept(remote, PeerVersion::new("ferry:test", 7));

        let (handle, handshake) = network.transport().dial(remote).await.unwrap().into_parts();
        assert_eq!(handle.state(), PeerState::Connecting);

        handshake.perform().await.unwrap();
        assert_eq!(handle.state(), PeerState::Handshaked);
        assert_eq!(handle.version().unwrap().start_height, 7);
        assert!(Arc::ptr_eq(&network.latest(&remote).unwrap(), &handle));
    }

    #[tokio::test]
    async fn test_rejecting_endpoint_fails_handshake() {
        let network = MemoryNetwork::new();
        let remote = addr("10.0.0.1:9333");
        network.reject_handshake(remote, "wrong network");

        let (handle, handshake) = network.transport().dial(remote).await.unwrap().into_parts();
        assert!(handshake.perform().await.is_err());
        assert_eq!(handle.state(), PeerState::Failed);
        assert!(handle.disconnect_reason().unwrap().reason.contains("wrong network"));
    }

    #[tokio::test]
    async fn test_stalled_handshake_ends_on_disconnect() {
        let network = MemoryNetwork::new();
        let remote = addr("10.0.0.1:9333");
        network.register(remote, RemoteBehavior::Stall);

        let (handle, handshake) = network.transport().dial(remote).await.unwrap().into_parts();
        let task = tokio::spawn(handshake.perform());
        settle().await;
        assert_eq!(handle.state(), PeerState::HandshakeInProgress);

        handle.disconnect("stopping").unwrap();
        assert!(task.await.unwrap().is_err());
        assert_eq!(handle.state(), PeerState::Offline);
    }

    #[tokio::test]
    async fn test_close_remote_takes_handle_offline() {
        let network = MemoryNetwork::new();
        let remote = addr("10.0.0.1:9333");
        network.accept(remote, PeerVersion::new("ferry:test", 0));

        let (handle, handshake) = network.transport().dial(remote).await.unwrap().into_parts();
        handshake.perform().await.unwrap();

        assert!(network.close_remote(&remote));
        settle().await;
        assert_eq!(handle.state(), PeerState::Offline);
        assert_eq!(handle.disconnect_reason().unwrap().reason, "remote closed connection");
    }

    #[tokio::test]
    async fn test_severed_peer_fails_disconnect() {
        let network = MemoryNetwork::new();
        let remote = addr("10.0.0.1:9333");
        network.accept(remote, PeerVersion::new("ferry:test", 0));

        let (handle, handshake) = network.transport().dial(remote).await.unwrap().into_parts();
        handshake.perform().await.unwrap();

        assert!(network.sever(&remote));
        settle().await;
        assert!(matches!(handle.disconnect("bye"), Err(P2pError::ChannelSend(_))));
    }

    #[tokio::test]
    async fn test_listener_receives_injected_connection() {
        let network = MemoryNetwork::new();
        let listener = network.transport().listen(addr("127.0.0.1:0")).await.unwrap();
        let local = listener.local_addr();
        assert_eq!(local.port(), EPHEMERAL_PORT_START);

        let injected = network
            .inject_inbound(local, addr("10.0.0.9:5000"), RemoteBehavior::Accept(PeerVersion::new("x", 1)))
            .unwrap();
        let accepted = listener.accept().await.unwrap();

        assert!(Arc::ptr_eq(&accepted.handle, &injected));
        assert!(injected.is_inbound());
    }

    #[tokio::test]
    async fn test_bind_conflicts() {
        let network = MemoryNetwork::new();
        let transport = network.transport();
        let taken = addr("127.0.0.1:9333");
        network.occupy(taken);

        assert!(matches!(transport.listen(taken).await, Err(P2pError::Io(_))));

        let first = transport.listen(addr("127.0.0.1:9444")).await.unwrap();
        assert!(transport.listen(addr("127.0.0.1:9444")).await.is_err());
        drop(first);
        assert!(transport.listen(addr("127.0.0.1:9444")).await.is_ok());
    }

    #[tokio::test]
    async fn test_inject_without_listener_fails() {
        let network = MemoryNetwork::new();
        let result = network.inject_inbound(
            addr("127.0.0.1:9333"),
            addr("10.0.0.9:5000"),
            RemoteBehavior::Stall,
        );
        assert!(matches!(result, Err(P2pError::InvalidState(_))));
    }
}
