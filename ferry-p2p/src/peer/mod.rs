//! Peer connection primitives.
//!
//! This module provides:
//! - The shared peer handle with scoped state subscriptions
//! - Connection lifecycle states
//! - Metadata announced or observed over a connection

pub mod handle;
pub mod info;
pub mod state;

// Re-export main types
pub use handle::{PeerCommand, PeerHandle, StateListener, Subscription};
pub use info::{ConnectionDirection, DisconnectReason, PeerVersion};
pub use state::{PeerState, StateChange};
