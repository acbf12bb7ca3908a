//! Access control hooks.

use libp2p::{Multiaddr, PeerId};

/// An ACL filter consulted before admitting reservations and circuits.
///
/// Implementations must be cheap and non-blocking; the relay calls them on
/// the hot path of every request.
pub trait AclFilter: Send + Sync {
    /// May `peer`, connected from `addr`, reserve a slot?
    fn allow_reserve(&self, peer: &PeerId, addr: &Multiaddr) -> bool;

    /// May `src`, connected from `addr`, open a circuit to `dest`?
    fn allow_connect(&self, src: &PeerId, addr: &Multiaddr, dest: &PeerId) -> bool;
}
