//! Address store feeding the connection pools.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Longest backoff, as a multiple of the base backoff.
const MAX_BACKOFF_FACTOR: u32 = 16;

/// Upper bound on any single backoff window.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// What the book knows about one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    /// The peer endpoint.
    pub addr: SocketAddr,
    /// Who told us about this address.
    pub source: IpAddr,
    /// When the address was added.
    pub added_at: Instant,
    /// Number of dial attempts.
    pub attempts: u32,
    /// Consecutive failures since the last success.
    pub failures: u32,
    /// When we last tried to connect.
    pub last_attempt: Option<Instant>,
    /// When a handshake with this address last succeeded.
    pub last_success: Option<Instant>,
    /// Not a candidate before this instant.
    pub retry_after: Option<Instant>,
}

impl AddressEntry {
    fn new(addr: SocketAddr, source: IpAddr, now: Instant) -> Self {
        Self {
            addr,
            source,
            added_at: now,
            attempts: 0,
            failures: 0,
            last_attempt: None,
            last_success: None,
            retry_after: None,
        }
    }

    /// Whether the address may be dialed at `now`.
    pub fn is_ready(&self, now: Instant) -> bool {
        self.retry_after.map_or(true, |at| now >= at)
    }
}

#[derive(Debug, Default)]
struct BookInner {
    entries: HashMap<SocketAddr, AddressEntry>,
    /// Insertion order, for stable candidate ordering.
    order: Vec<SocketAddr>,
}

/// Thread-safe set of known peer addresses.
///
/// Addresses are unique; adding a known address again is a no-op. Failed
/// addresses are held back for a backoff window that doubles with every
/// consecutive failure.
#[derive(Debug)]
pub struct AddressBook {
    inner: Mutex<BookInner>,
    backoff: Duration,
}

impl AddressBook {
    /// Create an empty address book.
    pub fn new(backoff: Duration) -> Self {
        Self {
            inner: Mutex::new(BookInner::default()),
            backoff,
        }
    }

    /// Create a book holding only `addrs`.
    pub fn with_addresses(
        addrs: impl IntoIterator<Item = SocketAddr>,
        source: IpAddr,
        backoff: Duration,
    ) -> Self {
        let book = Self::new(backoff);
        book.add(addrs, source);
        book
    }

    /// Add addresses. Returns how many were new.
    pub fn add(&self, addrs: impl IntoIterator<Item = SocketAddr>, source: IpAddr) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut added = 0;

        for addr in addrs {
            if inner.entries.contains_key(&addr) {
                continue;
            }
            inner.entries.insert(addr, AddressEntry::new(addr, source, now));
            inner.order.push(addr);
            added += 1;
        }

        if added > 0 {
            tracing::debug!(added, total = inner.entries.len(), "Addresses added to book");
        }
        added
    }

    /// Add one address. Returns `false` if it was already known.
    pub fn add_address(&self, addr: SocketAddr, source: IpAddr) -> bool {
        self.add(std::iter::once(addr), source) == 1
    }

    /// Check if an address is known.
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.inner.lock().entries.contains_key(addr)
    }

    /// Get the stored entry for an address.
    pub fn entry(&self, addr: &SocketAddr) -> Option<AddressEntry> {
        self.inner.lock().entries.get(addr).cloned()
    }

    /// Number of known addresses.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All known addresses in insertion order.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.inner.lock().order.clone()
    }

    /// Record a dial attempt.
    pub fn mark_attempt(&self, addr: &SocketAddr) {
        let now = Instant::now();
        if let Some(entry) = self.inner.lock().entries.get_mut(addr) {
            entry.attempts += 1;
            entry.last_attempt = Some(now);
        }
    }

    /// Record a failed dial or handshake.
    pub fn mark_failed(&self, addr: &SocketAddr) {
        self.mark_failed_at(addr, Instant::now());
    }

    /// Record a failure observed at `now` and start its backoff window.
    pub fn mark_failed_at(&self, addr: &SocketAddr, now: Instant) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(addr) {
            entry.failures = entry.failures.saturating_add(1);
            let delay = self.backoff_for(entry.failures);
            entry.retry_after = Some(now + delay);
            tracing::trace!(addr = %addr, failures = entry.failures, delay = ?delay, "Address backing off");
        }
    }

    /// Record a completed handshake. Clears the failure history.
    pub fn mark_success(&self, addr: &SocketAddr) {
        let now = Instant::now();
        if let Some(entry) = self.inner.lock().entries.get_mut(addr) {
            entry.failures = 0;
            entry.retry_after = None;
            entry.last_success = Some(now);
        }
    }

    /// Backoff after `failures` consecutive failures.
    fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(MAX_BACKOFF_FACTOR.trailing_zeros());
        self.backoff
            .saturating_mul(1u32 << exponent)
            .min(MAX_RETRY_DELAY)
    }

    /// Addresses dialable at `now`, most promising first.
    ///
    /// Ordering: fewest consecutive failures, then never-attempted before
    /// attempted, then least recently attempted, then insertion order.
    pub(crate) fn candidates(&self, now: Instant) -> Vec<SocketAddr> {
        let inner = self.inner.lock();
        let mut ready: Vec<(usize, &AddressEntry)> = inner
            .order
            .iter()
            .enumerate()
            .filter_map(|(idx, addr)| inner.entries.get(addr).map(|entry| (idx, entry)))
            .filter(|(_, entry)| entry.is_ready(now))
            .collect();

        ready.sort_by_key(|(idx, entry)| (entry.failures, entry.last_attempt, *idx));
        ready.into_iter().map(|(_, entry)| entry.addr).collect()
    }
}
