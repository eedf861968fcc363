//! Inbound connection listener.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::ListenEndpoint;
use crate::error::{P2pError, P2pResult};
use crate::manager::bridge::{BridgeFlags, BridgeTemplate, LifecycleBridge};
use crate::manager::registry::ConnectedPeers;
use crate::peer::{PeerHandle, PeerState, Subscription};
use crate::transport::{Connection, Listener, Transport};

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

struct AcceptedPeer {
    handle: Arc<PeerHandle>,
    _bridge: LifecycleBridge,
    _watch: Subscription,
}

struct ListenerInner {
    local_addr: SocketAddr,
    template: BridgeTemplate,
    registry: ConnectedPeers,
    accepted: Mutex<Vec<AcceptedPeer>>,
    shutdown: CancellationToken,
}

/// Accept loop for one listen endpoint.
///
/// Every accepted peer is tagged inbound and carries the endpoint's
/// whitelisted flag. Dropping the listener stops accepting.
pub struct InboundListener {
    endpoint: ListenEndpoint,
    inner: Arc<ListenerInner>,
}

impl InboundListener {
    /// Bind `endpoint` and spawn the accept loop.
    pub async fn bind(
        endpoint: ListenEndpoint,
        transport: &Arc<dyn Transport>,
        registry: ConnectedPeers,
    ) -> P2pResult<Self> {
        let listener = transport.listen(endpoint.addr).await.map_err(|e| match e {
            P2pError::Io(source) => P2pError::Bind {
                addr: endpoint.addr,
                source,
            },
            other => other,
        })?;

        let local_addr = listener.local_addr();
        tracing::debug!(
            addr = %local_addr,
            whitelisted = endpoint.whitelisted,
            "Listening for inbound connections"
        );

        let inner = Arc::new(ListenerInner {
            local_addr,
            template: BridgeTemplate::new(BridgeFlags::inbound(endpoint.whitelisted)),
            registry,
            accepted: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(run_accept_loop(listener, inner.clone()));

        Ok(Self { endpoint, inner })
    }

    /// The endpoint as configured.
    pub fn endpoint(&self) -> ListenEndpoint {
        self.endpoint
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_whitelisted(&self) -> bool {
        self.endpoint.whitelisted
    }

    /// The bound address paired with the whitelisted flag.
    pub fn bound_endpoint(&self) -> ListenEndpoint {
        ListenEndpoint {
            addr: self.local_addr(),
            whitelisted: self.endpoint.whitelisted,
        }
    }

    /// Peers accepted and not yet terminated.
    pub fn accepted_count(&self) -> usize {
        self.inner.accepted.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop accepting and disconnect every accepted peer.
    ///
    /// Failures are collected into one [`P2pError::Disposal`]. Closing twice
    /// is a no-op.
    pub fn close(&self) -> P2pResult<()> {
        self.inner.shutdown.cancel();

        let accepted: Vec<AcceptedPeer> = std::mem::take(&mut *self.inner.accepted.lock());
        let mut failures = Vec::new();
        for peer in &accepted {
            if let Err(e) = peer.handle.disconnect("listener closed") {
                failures.push(format!("{}: {}", peer.handle.addr(), e));
            }
        }

        if !accepted.is_empty() {
            tracing::debug!(
                addr = %self.inner.local_addr,
                disconnected = accepted.len(),
                failures = failures.len(),
                "Listener closed"
            );
        }
        P2pError::from_failures(failures)
    }
}

impl Drop for InboundListener {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl ListenerInner {
    fn admit(self: &Arc<Self>, connection: Connection) {
        let (handle, handshake) = connection.into_parts();
        tracing::debug!(
            addr = %handle.addr(),
            listener = %self.local_addr,
            "Accepted inbound connection"
        );

        let mut bridge = self.template.bind(handle.clone(), self.registry.clone());
        bridge.attach();

        let listener: Weak<ListenerInner> = Arc::downgrade(self);
        let watch = handle.subscribe(move |peer, change| {
            if change.new.is_terminal() {
                if let Some(listener) = listener.upgrade() {
                    listener.release(peer);
                }
            }
        });

        let rejected = {
            let mut accepted = self.accepted.lock();
            let peer = AcceptedPeer {
                handle: handle.clone(),
                _bridge: bridge,
                _watch: watch,
            };
            if self.shutdown.is_cancelled() {
                Some(peer)
            } else {
                accepted.push(peer);
                None
            }
        };

        if let Some(peer) = rejected {
            if let Err(e) = peer.handle.disconnect("listener closed") {
                tracing::debug!(addr = %handle.addr(), error = %e, "Disconnect failed");
            }
            return;
        }

        if handle.state().is_terminal() {
            self.release(&handle);
            return;
        }

        tokio::spawn(async move {
            if let Err(e) = handshake.perform().await {
                tracing::debug!(addr = %handle.addr(), error = %e, "Inbound handshake failed");
                handle.set_state(PeerState::Failed);
            }
        });
    }

    fn release(&self, peer: &Arc<PeerHandle>) {
        let removed: Vec<AcceptedPeer> = {
            let mut accepted = self.accepted.lock();
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *accepted)
                .into_iter()
                .partition(|p| Arc::ptr_eq(&p.handle, peer));
            *accepted = kept;
            gone
        };
        drop(removed);
    }
}

async fn run_accept_loop(listener: Box<dyn Listener>, inner: Arc<ListenerInner>) {
    loop {
        let accepted = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            result = listener.accept() => result,
        };

        match accepted {
            Ok(connection) => inner.admit(connection),
            Err(e) => {
                tracing::warn!(addr = %inner.local_addr, error = %e, "Failed to accept connection");
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                }
            }
        }
    }

    tracing::debug!(addr = %inner.local_addr, "Inbound listener shutting down");
}
