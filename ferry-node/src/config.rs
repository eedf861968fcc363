//! Node configuration.

use std::net::SocketAddr;
use std::time::Duration;

use ferry_p2p::{ConnmanConfig, ListenEndpoint};

use crate::cli::Cli;

/// Complete node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Plain listen addresses.
    pub listen: Vec<SocketAddr>,

    /// Listen addresses whose peers are whitelisted.
    pub whitebind: Vec<SocketAddr>,

    /// Explicit peers. Replaces discovery when non-empty.
    pub connect: Vec<SocketAddr>,

    /// Peers kept connected alongside the others.
    pub add_node: Vec<SocketAddr>,

    /// Seed nodes for the discovery address book.
    pub seed_nodes: Vec<SocketAddr>,

    /// Target of the discovery pool.
    pub max_outbound: usize,

    /// Interval between bandwidth reports, if enabled.
    pub stats_interval: Option<Duration>,

    /// Log level.
    pub log_level: String,
}

impl NodeConfig {
    /// Create a node configuration from CLI arguments.
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            listen: cli.listen.clone(),
            whitebind: cli.whitebind.clone(),
            connect: cli.connect.clone(),
            add_node: cli.addnode.clone(),
            seed_nodes: cli.seed_nodes.clone().unwrap_or_default(),
            max_outbound: cli.max_outbound,
            stats_interval: (cli.stats_interval > 0)
                .then(|| Duration::from_secs(cli.stats_interval)),
            log_level: cli.log_level.clone(),
        }
    }

    /// Build the connection manager configuration.
    ///
    /// Whitelisted endpoints follow the plain ones.
    pub fn connman_config(&self) -> ConnmanConfig {
        let listen = self
            .listen
            .iter()
            .copied()
            .map(ListenEndpoint::new)
            .chain(self.whitebind.iter().copied().map(ListenEndpoint::whitelisted));

        let mut config = ConnmanConfig::new()
            .with_connect(self.connect.clone())
            .with_add_node(self.add_node.clone())
            .with_max_outbound(self.max_outbound);
        for endpoint in listen {
            config = config.with_listen(endpoint);
        }
        config
    }

    /// Whether outbound peers come from the seed-fed discovery book.
    pub fn uses_discovery(&self) -> bool {
        self.connect.is_empty()
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: vec![SocketAddr::from(([0, 0, 0, 0], 9333))],
            whitebind: Vec::new(),
            connect: Vec::new(),
            add_node: Vec::new(),
            seed_nodes: Vec::new(),
            max_outbound: ferry_p2p::config::DEFAULT_MAX_OUTBOUND,
            stats_interval: Some(Duration::from_secs(60)),
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.listen[0].port(), 9333);
        assert!(config.uses_discovery());

        let connman = config.connman_config();
        assert_eq!(connman.listen.len(), 1);
        assert!(!connman.listen[0].whitelisted);
        assert!(connman.validate().is_ok());
    }

    #[test]
    fn test_from_cli() {
        let cli = Cli::parse_from([
            "ferry-node",
            "--listen",
            "127.0.0.1:9333",
            "--whitebind",
            "127.0.0.1:9444",
            "--connect",
            "10.0.0.1:9333",
            "--stats-interval",
            "0",
        ]);
        let config = NodeConfig::from_cli(&cli);
        assert!(!config.uses_discovery());
        assert!(config.stats_interval.is_none());

        let connman = config.connman_config();
        assert_eq!(connman.listen.len(), 2);
        assert!(!connman.listen[0].whitelisted);
        assert!(connman.listen[1].whitelisted);
        assert_eq!(connman.listen[1].addr.port(), 9444);
        assert_eq!(connman.connect.len(), 1);
        assert!(!connman.uses_discovery());
    }

    #[test]
    fn test_seed_nodes_default_empty() {
        let cli = Cli::parse_from(["ferry-node", "--addnode", "10.0.0.3:9333"]);
        let config = NodeConfig::from_cli(&cli);
        assert!(config.seed_nodes.is_empty());
        assert_eq!(config.connman_config().add_node.len(), 1);
        assert_eq!(config.stats_interval, Some(Duration::from_secs(60)));
    }
}
