//! Node orchestrator.
//!
//! Wires the connection manager to a TCP transport, reports bandwidth on an
//! interval and tears everything down on shutdown.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use ferry_p2p::{AddressBook, ConnectionManager, TcpTransport, Transport};

use crate::config::NodeConfig;
use crate::shutdown::{shutdown_channel, wait_for_shutdown_signal, ShutdownGuard, ShutdownTx};

/// Source recorded for seed addresses.
const SEED_SOURCE: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// The main node structure.
pub struct Node {
    /// Node configuration.
    config: NodeConfig,

    /// Connection manager.
    manager: Arc<ConnectionManager>,

    /// Shutdown signal sender.
    shutdown_tx: ShutdownTx,
}

impl Node {
    /// Create a new node with the given configuration.
    pub fn new(config: NodeConfig) -> anyhow::Result<Self> {
        let connman = config.connman_config();
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(&connman, 0));

        let discovery = Arc::new(AddressBook::with_addresses(
            config.seed_nodes.iter().copied(),
            SEED_SOURCE,
            connman.dial_backoff,
        ));
        if config.uses_discovery() {
            tracing::info!(seeds = discovery.len(), "Discovery address book seeded");
        }

        let manager = Arc::new(ConnectionManager::new(connman, transport, discovery)?);
        let (shutdown_tx, _) = shutdown_channel();

        Ok(Self {
            config,
            manager,
            shutdown_tx,
        })
    }

    /// The connection manager driven by this node.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Run the node until SIGINT or SIGTERM.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.run_until(async {
            if let Err(e) = wait_for_shutdown_signal().await {
                tracing::error!(error = %e, "Failed to install signal handlers");
            }
        })
        .await
    }

    /// Run the node until `shutdown` completes.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        tracing::info!("Starting ferry node...");
        tracing::info!("  Connect list: {}", self.config.connect.len());
        tracing::info!("  Add nodes: {}", self.config.add_node.len());
        tracing::info!("  Max outbound: {}", self.config.max_outbound);

        self.manager.start().await?;

        let stats_handle = self.config.stats_interval.map(|interval| {
            let manager = self.manager.clone();
            let guard = ShutdownGuard::new(&self.shutdown_tx);
            tokio::spawn(run_stats_task(manager, interval, guard))
        });

        shutdown.await;

        tracing::info!("Shutting down node...");
        let _ = self.shutdown_tx.send(());

        if let Some(handle) = stats_handle {
            let _ = handle.await;
            tracing::info!("Stats task stopped");
        }

        self.manager.dispose()?;
        tracing::info!("Node shutdown complete");
        Ok(())
    }
}

/// Log a bandwidth report every `interval` until shutdown.
async fn run_stats_task(
    manager: Arc<ConnectionManager>,
    interval: Duration,
    mut guard: ShutdownGuard,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately and there is no baseline yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = guard.wait() => break,
            _ = ticker.tick() => {
                tracing::info!(
                    peers = manager.connected_peers().len(),
                    "\n{}",
                    manager.get_stats()
                );
            }
        }
    }
}
