//! Reservation table.

use std::collections::HashMap;
use std::time::Instant;

use libp2p::PeerId;

/// Live reservation slots: peer → expiry.
///
/// The table itself is just the map; admission limits live in
/// [`crate::constraints::ConstraintTable`] and the service layer decides
/// when to sweep.
#[derive(Default)]
pub(crate) struct ReservationTable {
    entries: HashMap<PeerId, Instant>,
}

impl ReservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a slot. Returns `true` when the peer already held
    /// one (a refresh).
    pub fn insert(&mut self, peer: PeerId, expires_at: Instant) -> bool {
        self.entries.insert(peer, expires_at).is_some()
    }

    /// Whether the peer currently holds a slot, expired or not. Expired
    /// slots admit circuits until a sweep removes them.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.entries.contains_key(peer)
    }

    #[cfg(test)]
    pub fn expiry(&self, peer: &PeerId) -> Option<Instant> {
        self.entries.get(peer).copied()
    }

    /// Remove a peer's slot. Returns `true` if one existed.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        self.entries.remove(peer).is_some()
    }

    /// Remove expired slots — all slots when `evict_all` — and return the
    /// evicted peers so the caller can untag them.
    pub fn sweep(&mut self, now: Instant, evict_all: bool) -> Vec<PeerId> {
        let mut evicted = Vec::new();
        self.entries.retain(|peer, expires_at| {
            if evict_all || *expires_at < now {
                evicted.push(*peer);
                false
            } else {
                true
            }
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
