//! Bandwidth accounting by diffing periodic counter snapshots.

use std::collections::HashMap;
use std::fmt::Write;
use std::time::Instant;

use parking_lot::Mutex;

use crate::manager::ConnectedPeer;

/// Once the snapshot table grows past this, it is cleared wholesale.
pub const MAX_TRACKED_SNAPSHOTS: usize = 1000;

/// Point-in-time copy of a peer's cumulative counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub taken_at: Instant,
}

impl BandwidthSnapshot {
    /// Read and write rates in bytes per second since `earlier`.
    pub fn rates_since(&self, earlier: &BandwidthSnapshot) -> (f64, f64) {
        let elapsed = self.taken_at.saturating_duration_since(earlier.taken_at).as_secs_f64();
        if elapsed <= 0.0 {
            return (0.0, 0.0);
        }
        let read = self.bytes_read.saturating_sub(earlier.bytes_read) as f64;
        let written = self.bytes_written.saturating_sub(earlier.bytes_written) as f64;
        (read / elapsed, written / elapsed)
    }
}

/// Produces throughput reports for the connected peers.
#[derive(Debug, Default)]
pub struct BandwidthTracker {
    /// Keyed by handle id.
    snapshots: Mutex<HashMap<u64, BandwidthSnapshot>>,
}

impl BandwidthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of peers with a recorded baseline.
    pub fn tracked(&self) -> usize {
        self.snapshots.lock().len()
    }

    /// Build a report over `peers` using the current time.
    pub fn report(&self, peers: &[ConnectedPeer]) -> String {
        self.report_at(peers, Instant::now())
    }

    /// Build a report over `peers` as of `now`.
    ///
    /// A peer without a prior snapshot only records its baseline this round.
    pub fn report_at(&self, peers: &[ConnectedPeer], now: Instant) -> String {
        let mut out = String::new();
        let mut total_read = 0.0;
        let mut total_written = 0.0;

        let mut snapshots = self.snapshots.lock();
        out.push_str("====Connections====\n");

        for peer in peers {
            let addr = peer.handle.addr();
            let (bytes_read, bytes_written) = peer.handle.counters();
            let current = BandwidthSnapshot {
                bytes_read,
                bytes_written,
                taken_at: now,
            };

            if let Some(previous) = snapshots.get(&peer.handle.id()) {
                let (read, written) = current.rates_since(previous);
                total_read += read;
                total_written += written;
                let _ = writeln!(
                    out,
                    "{}:{}\t => R: {}\tW: {}",
                    addr.ip(),
                    addr.port(),
                    to_kb_per_sec(read),
                    to_kb_per_sec(written)
                );
            }
            snapshots.insert(peer.handle.id(), current);
        }

        out.push_str("==========================\n");
        let _ = writeln!(
            out,
            "Total\t => R: {}\tW: {}",
            to_kb_per_sec(total_read),
            to_kb_per_sec(total_written)
        );
        out.push_str("==========================\n");

        // Stale entries are never pruned one by one.
        if snapshots.len() > MAX_TRACKED_SNAPSHOTS {
            tracing::debug!(tracked = snapshots.len(), "Clearing bandwidth snapshots");
            snapshots.clear();
        }

        out
    }
}

fn to_kb_per_sec(bytes_per_sec: f64) -> String {
    format!("{:.2} KB/S", bytes_per_sec / 1024.0)
}
