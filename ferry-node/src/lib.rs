//! Ferry node library.
//!
//! This library provides the components for running a ferry P2P node on top
//! of the `ferry-p2p` connection manager. It is used by the `ferry-node`
//! binary and can also be used for testing and embedding.

pub mod cli;
pub mod config;
pub mod node;
pub mod shutdown;
