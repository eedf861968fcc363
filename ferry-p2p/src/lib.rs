//! Connection management for a P2P node.
//!
//! This crate keeps a node connected to the overlay:
//!
//! - Outbound connection pools with per-pool selection policies and targets
//! - Inbound listeners tagging accepted peers as inbound and whitelisted
//! - A registry of handshaked peers driven by per-connection lifecycle bridges
//! - Bandwidth accounting by diffing per-peer traffic snapshots
//!
//! # Architecture
//!
//! Every connection runs in its own tokio task behind a shared
//! [`PeerHandle`]. Pools and listeners attach a [`LifecycleBridge`] to each
//! handle they create; the bridge promotes the peer into [`ConnectedPeers`]
//! on handshake and removes it on failure or disconnect.
//!
//! ```text
//! ConnectionManager
//! ├── Discovery pool or connect-list pool (dial loop + one task per dial)
//! ├── Add-node pool (dial loop + one task per dial)
//! ├── InboundListener per listen endpoint (accept loop)
//! ├── ConnectedPeers (handshaked peers, fed by bridges)
//! └── BandwidthTracker (reads ConnectedPeers on demand)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use ferry_p2p::{AddressBook, ConnectionManager, ConnmanConfig, ListenEndpoint, TcpTransport};
//!
//! let config = ConnmanConfig::new()
//!     .with_listen(ListenEndpoint::new("0.0.0.0:9333".parse().unwrap()));
//! let transport = Arc::new(TcpTransport::new(&config, 0));
//! let book = Arc::new(AddressBook::new(config.dial_backoff));
//!
//! let manager = ConnectionManager::new(config, transport, book)?;
//! manager.start().await?;
//! println!("{}", manager.get_stats());
//! manager.dispose()?;
//! ```

pub mod config;
pub mod error;

pub mod addrman;
pub mod manager;
pub mod peer;
pub mod stats;
pub mod transport;

// Re-export main types
pub use addrman::{AddressBook, AddressEntry, GroupSelector, NetworkGroup};
pub use config::{ConnmanConfig, ListenEndpoint, DEFAULT_USER_AGENT};
pub use error::{P2pError, P2pResult};
pub use manager::{
    BridgeFlags, BridgeTemplate, ConnectedPeer, ConnectedPeers, ConnectionManager,
    ConnectionPool, InboundListener, LifecycleBridge, ManagerState, PoolKind,
};
pub use peer::{
    ConnectionDirection, DisconnectReason, PeerHandle, PeerState, PeerVersion, StateChange,
    Subscription,
};
pub use stats::BandwidthTracker;
pub use transport::{MemoryNetwork, RemoteBehavior, TcpTransport, Transport};
