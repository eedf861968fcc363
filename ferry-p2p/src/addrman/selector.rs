//! Peer selection policies.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use crate::addrman::book::AddressBook;
use crate::addrman::group::NetworkGroup;

/// How a pool picks the next address to dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSelector {
    /// Peers from one network group are interchangeable: never hold two
    /// connections into the same group.
    ByNetwork,
    /// Every address is required on its own.
    ByEndpoint,
}

impl GroupSelector {
    /// Pick the next address to dial, skipping everything in `excluding`
    /// (addresses the pool already owns or is dialing).
    pub fn next_candidate(
        &self,
        book: &AddressBook,
        excluding: &HashSet<SocketAddr>,
    ) -> Option<SocketAddr> {
        self.next_candidate_at(book, excluding, Instant::now())
    }

    /// [`next_candidate`](Self::next_candidate) with an explicit clock.
    pub fn next_candidate_at(
        &self,
        book: &AddressBook,
        excluding: &HashSet<SocketAddr>,
        now: Instant,
    ) -> Option<SocketAddr> {
        let mut candidates = book
            .candidates(now)
            .into_iter()
            .filter(|addr| !excluding.contains(addr));

        match self {
            GroupSelector::ByEndpoint => candidates.next(),
            GroupSelector::ByNetwork => {
                let taken: HashSet<NetworkGroup> = excluding.iter().map(NetworkGroup::of).collect();
                candidates.find(|addr| !taken.contains(&NetworkGroup::of(addr)))
            }
        }
    }
}

impl fmt::Display for GroupSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupSelector::ByNetwork => write!(f, "by_network"),
            GroupSelector::ByEndpoint => write!(f, "by_endpoint"),
        }
    }
}
