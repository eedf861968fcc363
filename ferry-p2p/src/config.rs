//! Connection manager configuration.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{P2pError, P2pResult};

/// Default target number of outbound connections for the discovery pool.
pub const DEFAULT_MAX_OUTBOUND: usize = 8;

/// Default connection timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval at which pools re-check their targets.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Default backoff applied to an address after a failed dial or handshake.
pub const DEFAULT_DIAL_BACKOFF: Duration = Duration::from_secs(10);

/// Default user agent string, stamped with the crate version.
pub const DEFAULT_USER_AGENT: &str = concat!("ferry:", env!("CARGO_PKG_VERSION"));

/// A local endpoint to accept inbound connections on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenEndpoint {
    /// Address to bind.
    pub addr: SocketAddr,
    /// Whether peers accepted on this endpoint are whitelisted.
    pub whitelisted: bool,
}

impl ListenEndpoint {
    /// A regular listen endpoint.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            whitelisted: false,
        }
    }

    /// A listen endpoint whose peers are whitelisted.
    pub fn whitelisted(addr: SocketAddr) -> Self {
        Self {
            addr,
            whitelisted: true,
        }
    }
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr.ip(), self.addr.port())?;
        if self.whitelisted {
            write!(f, " (whitelisted)")?;
        }
        Ok(())
    }
}

/// Configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnmanConfig {
    /// Endpoints to accept inbound connections on.
    pub listen: Vec<ListenEndpoint>,

    /// Explicit peers to connect to. When non-empty, replaces discovery.
    pub connect: Vec<SocketAddr>,

    /// Peers to always keep a connection to, in addition to the others.
    pub add_node: Vec<SocketAddr>,

    /// Target connection count of the discovery pool.
    pub max_outbound: usize,

    /// Timeout for establishing outbound connections.
    pub connect_timeout: Duration,

    /// Timeout for completing the handshake.
    pub handshake_timeout: Duration,

    /// Interval at which pools re-check their connection targets.
    pub retry_interval: Duration,

    /// Backoff after a failed dial, doubled per consecutive failure.
    pub dial_backoff: Duration,

    /// User agent string sent during the handshake.
    pub user_agent: String,
}

impl Default for ConnmanConfig {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            connect: Vec::new(),
            add_node: Vec::new(),
            max_outbound: DEFAULT_MAX_OUTBOUND,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            dial_backoff: DEFAULT_DIAL_BACKOFF,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ConnmanConfig {
    /// Create a configuration with defaults and no endpoints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listen endpoint.
    pub fn with_listen(mut self, endpoint: ListenEndpoint) -> Self {
        self.listen.push(endpoint);
        self
    }

    /// Set the explicit connect list.
    pub fn with_connect(mut self, peers: Vec<SocketAddr>) -> Self {
        self.connect = peers;
        self
    }

    /// Set the add-node list.
    pub fn with_add_node(mut self, peers: Vec<SocketAddr>) -> Self {
        self.add_node = peers;
        self
    }

    /// Set the discovery pool target.
    pub fn with_max_outbound(mut self, count: usize) -> Self {
        self.max_outbound = count;
        self
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the pool retry interval.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the dial backoff.
    pub fn with_dial_backoff(mut self, backoff: Duration) -> Self {
        self.dial_backoff = backoff;
        self
    }

    /// Set the user agent string.
    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// Whether the discovery pool is used (no explicit connect list).
    pub fn uses_discovery(&self) -> bool {
        self.connect.is_empty()
    }

    /// Check the configuration for errors that must abort startup.
    pub fn validate(&self) -> P2pResult<()> {
        let mut seen = HashSet::new();
        for endpoint in &self.listen {
            if !seen.insert(endpoint.addr) {
                return Err(P2pError::Configuration(format!(
                    "listen endpoint {} configured more than once",
                    endpoint.addr
                )));
            }
        }

        for addr in self.connect.iter().chain(self.add_node.iter()) {
            if addr.ip().is_unspecified() || addr.port() == 0 {
                return Err(P2pError::Configuration(format!(
                    "invalid peer address {addr}"
                )));
            }
        }

        // Every entry adds one to its pool's target.
        for (name, list) in [("connect", &self.connect), ("add_node", &self.add_node)] {
            let mut seen = HashSet::new();
            if let Some(addr) = list.iter().find(|addr| !seen.insert(**addr)) {
                return Err(P2pError::Configuration(format!(
                    "{name} peer {addr} configured more than once"
                )));
            }
        }

        if self.uses_discovery() && self.max_outbound == 0 {
            return Err(P2pError::Configuration(
                "discovery requires a non-zero outbound target".to_string(),
            ));
        }

        if self.retry_interval.is_zero() {
            return Err(P2pError::Configuration(
                "retry interval must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
