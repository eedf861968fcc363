//! Ferry node binary.
//!
//! Runs a connection manager over TCP until interrupted.

use tracing_subscriber::EnvFilter;

use ferry_node::cli::Cli;
use ferry_node::config::NodeConfig;
use ferry_node::node::Node;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    tracing::info!("Ferry Node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::from_cli(&cli);

    let node = Node::new(config)?;
    node.run().await?;

    Ok(())
}
