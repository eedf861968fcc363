//! Command-line argument parsing.

use std::net::SocketAddr;

use clap::Parser;

/// Ferry P2P node.
#[derive(Parser, Debug, Clone)]
#[command(name = "ferry-node")]
#[command(about = "P2P node keeping a connection pool to the overlay")]
#[command(version)]
pub struct Cli {
    /// P2P listen addresses.
    #[arg(long, value_delimiter = ',', default_value = "0.0.0.0:9333")]
    pub listen: Vec<SocketAddr>,

    /// Listen addresses whose inbound peers are whitelisted.
    #[arg(long, value_delimiter = ',')]
    pub whitebind: Vec<SocketAddr>,

    /// Connect only to these peers. Disables discovery.
    #[arg(long, value_delimiter = ',')]
    pub connect: Vec<SocketAddr>,

    /// Peers to keep a connection to in addition to the others.
    #[arg(long, value_delimiter = ',')]
    pub addnode: Vec<SocketAddr>,

    /// Comma-separated list of seed nodes for discovery.
    #[arg(long, value_delimiter = ',')]
    pub seed_nodes: Option<Vec<SocketAddr>>,

    /// Target number of discovered outbound connections.
    #[arg(long, default_value_t = ferry_p2p::config::DEFAULT_MAX_OUTBOUND)]
    pub max_outbound: usize,

    /// Seconds between bandwidth reports. 0 disables them.
    #[arg(long, default_value_t = 60)]
    pub stats_interval: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cli = Cli::parse_from(["ferry-node"]);
        assert_eq!(cli.listen.len(), 1);
        assert_eq!(cli.listen[0].port(), 9333);
        assert!(cli.whitebind.is_empty());
        assert!(cli.connect.is_empty());
        assert!(cli.addnode.is_empty());
        assert!(cli.seed_nodes.is_none());
        assert_eq!(cli.max_outbound, 8);
        assert_eq!(cli.stats_interval, 60);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_seed_nodes() {
        let cli = Cli::parse_from([
            "ferry-node",
            "--seed-nodes",
            "127.0.0.1:9333,192.168.1.1:9333",
        ]);
        let seeds = cli.seed_nodes.unwrap();
        assert_eq!(seeds.len(), 2);
    }

    #[test]
    fn test_connect_and_addnode_lists() {
        let cli = Cli::parse_from([
            "ferry-node",
            "--connect",
            "10.0.0.1:9333,10.0.0.2:9333",
            "--addnode",
            "10.0.0.3:9333",
            "--whitebind",
            "127.0.0.1:9444",
            "--max-outbound",
            "4",
        ]);
        assert_eq!(cli.connect.len(), 2);
        assert_eq!(cli.addnode, vec!["10.0.0.3:9333".parse::<SocketAddr>().unwrap()]);
        assert_eq!(cli.whitebind[0].port(), 9444);
        assert_eq!(cli.max_outbound, 4);
    }

    #[test]
    fn test_invalid_address_rejected() {
        assert!(Cli::try_parse_from(["ferry-node", "--connect", "not-an-address"]).is_err());
    }
}
