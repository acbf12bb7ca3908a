//! Per-peer active circuit counts.

use std::collections::HashMap;

use libp2p::PeerId;

/// Counts circuits a peer participates in, as source or destination. An
/// entry disappears when its count returns to zero, so the map only holds
/// peers with live circuits.
#[derive(Default)]
pub(crate) struct CircuitCounter {
    counts: HashMap<PeerId, usize>,
}

impl CircuitCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a peer's count. Returns `true` on the 0→1 transition, the
    /// point at which the service tags the peer.
    pub fn add(&mut self, peer: PeerId) -> bool {
        let count = self.counts.entry(peer).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Decrement a peer's count. Returns `true` when the count reaches zero
    /// and the entry is removed, the point at which the service untags.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        match self.counts.get_mut(peer) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.counts.remove(peer);
                true
            }
            None => false,
        }
    }

    pub fn count(&self, peer: &PeerId) -> usize {
        self.counts.get(peer).copied().unwrap_or(0)
    }

    /// Drop any zero-count entries. `remove` already deletes at zero; this
    /// is the sweeper's defensive pass.
    pub fn gc(&mut self) {
        self.counts.retain(|_, count| *count > 0);
    }
}
