//! Reservation voucher minting.
//!
//! Builds the `Reservation` body of an OK response: the relay's publicly
//! routable addresses, each normalized to carry the relay's peer id
//! component, plus a voucher sealed under the relay's identity key.

use std::net::{Ipv4Addr, Ipv6Addr};

use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tracing::warn;

use splicenet_proto::{Reservation, ReservationVoucher};

/// Build the reservation message for `peer`, expiring at `expire_unix`.
///
/// Sealing can only fail on a key mismatch inside the identity layer; in
/// that case the reservation is still returned, just without a voucher, and
/// the failure is logged.
pub(crate) fn make_reservation(
    key: &Keypair,
    self_id: PeerId,
    self_addrs: Vec<Multiaddr>,
    peer: PeerId,
    expire_unix: u64,
) -> Reservation {
    let mut addrs = Vec::with_capacity(self_addrs.len());
    for addr in self_addrs {
        if !is_public_addr(&addr) {
            continue;
        }
        match embedded_peer_id(&addr) {
            // No id component; add ours.
            None => addrs.push(addr.with(Protocol::P2p(self_id)).to_vec()),
            // Already carries our id.
            Some(id) if id == self_id => addrs.push(addr.to_vec()),
            Some(_) => {
                warn!("skipping address {addr}: contains an unexpected peer id");
            }
        }
    }

    let mut rsvp = Reservation {
        expire: expire_unix,
        addrs,
        voucher: None,
    };

    match ReservationVoucher::new(&self_id, &peer, expire_unix).seal(key) {
        Ok(blob) => rsvp.voucher = Some(blob),
        Err(err) => warn!("failed to seal reservation voucher for {peer}: {err}"),
    }

    rsvp
}

/// The trailing peer id component of an address, if present.
fn embedded_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().fold(None, |acc, proto| match proto {
        Protocol::P2p(id) => Some(id),
        _ => acc,
    })
}

/// Whether an address is publicly routable. DNS names count as public; the
/// resolver decides what they point at.
pub(crate) fn is_public_addr(addr: &Multiaddr) -> bool {
    match addr.iter().next() {
        Some(Protocol::Ip4(ip)) => is_public_v4(&ip),
        Some(Protocol::Ip6(ip)) => is_public_v6(&ip),
        Some(Protocol::Dns(_) | Protocol::Dns4(_) | Protocol::Dns6(_) | Protocol::Dnsaddr(_)) => {
            true
        }
        _ => false,
    }
}

fn is_public_v4(ip: &Ipv4Addr) -> bool {
    // 100.64.0.0/10, carrier-grade NAT
    let shared = ip.octets()[0] == 100 && (ip.octets()[1] & 0xC0) == 64;
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || shared)
}

fn is_public_v6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_public_v4(&v4);
    }
    let unique_local = (ip.segments()[0] & 0xFE00) == 0xFC00;
    let link_local = (ip.segments()[0] & 0xFFC0) == 0xFE80;
    !(ip.is_loopback() || ip.is_unspecified() || unique_local || link_local)
}
