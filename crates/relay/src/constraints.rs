//! Reservation admission constraints.
//!
//! Tracks how many reservation slots are held in total, per peer, per IP
//! prefix (/24 for v4, /48 for v6) and per autonomous system, and refuses
//! new slots past the configured caps. Expired slots are reclaimed lazily
//! on the next admission; a re-reservation releases the peer's previous
//! slots first, so refreshing never trips a cap against the peer itself.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;

use crate::config::Resources;

/// Resolves an IP address to its autonomous system number.
///
/// ASN data is an external concern; the relay only consumes the mapping.
/// Without a resolver the per-ASN cap is simply never hit.
pub trait AsnResolver: Send + Sync {
    fn asn(&self, ip: IpAddr) -> Option<u32>;
}

/// Why the constraint table refused a reservation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConstraintViolation {
    #[error("too many reservations")]
    TooManyReservations,

    #[error("no IP address associated with the peer")]
    NoIpAddress,

    #[error("too many reservations for peer")]
    PeerLimit,

    #[error("too many reservations for IP prefix")]
    IpLimit,

    #[error("too many reservations for ASN")]
    AsnLimit,
}

/// An IP grouped to its admission prefix: /24 for v4, /48 for v6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum IpPrefix {
    V4(u32),
    V6(u64),
}

impl IpPrefix {
    fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => IpPrefix::V4(u32::from(v4) & 0xFFFF_FF00),
            IpAddr::V6(v6) => IpPrefix::V6((u128::from(v6) >> 80) as u64),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    peer: PeerId,
    expires_at: Instant,
}

pub(crate) struct ConstraintTable {
    max_reservations: usize,
    max_per_peer: usize,
    max_per_ip: usize,
    max_per_asn: usize,
    asn_resolver: Option<Arc<dyn AsnResolver>>,

    total: Vec<Slot>,
    peers: HashMap<PeerId, Vec<Instant>>,
    prefixes: HashMap<IpPrefix, Vec<Slot>>,
    asns: HashMap<u32, Vec<Slot>>,
}

impl ConstraintTable {
    pub fn new(rc: &Resources, asn_resolver: Option<Arc<dyn AsnResolver>>) -> Self {
        Self {
            max_reservations: rc.max_reservations,
            max_per_peer: rc.max_reservations_per_peer,
            max_per_ip: rc.max_reservations_per_ip,
            max_per_asn: rc.max_reservations_per_asn,
            asn_resolver,
            total: Vec::new(),
            peers: HashMap::new(),
            prefixes: HashMap::new(),
            asns: HashMap::new(),
        }
    }

    /// Admit or refuse a reservation for `peer` observed at `addr`.
    ///
    /// On admission the slot is recorded against every applicable bucket
    /// with the given expiry. A peer re-reserving releases its previous
    /// slots first, so the caps count each peer once.
    pub fn reserve(
        &mut self,
        peer: PeerId,
        addr: &Multiaddr,
        expires_at: Instant,
        now: Instant,
    ) -> Result<(), ConstraintViolation> {
        self.cleanup(now);
        self.cleanup_peer(&peer);

        if self.total.len() >= self.max_reservations {
            return Err(ConstraintViolation::TooManyReservations);
        }

        let ip = multiaddr_ip(addr).ok_or(ConstraintViolation::NoIpAddress)?;
        let prefix = IpPrefix::of(ip);

        if self
            .peers
            .get(&peer)
            .is_some_and(|slots| slots.len() >= self.max_per_peer)
        {
            return Err(ConstraintViolation::PeerLimit);
        }

        if self
            .prefixes
            .get(&prefix)
            .is_some_and(|slots| slots.len() >= self.max_per_ip)
        {
            return Err(ConstraintViolation::IpLimit);
        }

        let asn = self.asn_resolver.as_ref().and_then(|r| r.asn(ip));
        if let Some(asn) = asn {
            if self
                .asns
                .get(&asn)
                .is_some_and(|slots| slots.len() >= self.max_per_asn)
            {
                return Err(ConstraintViolation::AsnLimit);
            }
        }

        let slot = Slot { peer, expires_at };
        self.total.push(slot);
        self.peers.entry(peer).or_default().push(expires_at);
        self.prefixes.entry(prefix).or_default().push(slot);
        if let Some(asn) = asn {
            self.asns.entry(asn).or_default().push(slot);
        }
        Ok(())
    }

    /// Release every slot held by `peer`.
    pub fn cleanup_peer(&mut self, peer: &PeerId) {
        self.total.retain(|slot| slot.peer != *peer);
        self.peers.remove(peer);
        self.prefixes.retain(|_, slots| {
            slots.retain(|slot| slot.peer != *peer);
            !slots.is_empty()
        });
        self.asns.retain(|_, slots| {
            slots.retain(|slot| slot.peer != *peer);
            !slots.is_empty()
        });
    }

    /// Reclaim expired slots.
    fn cleanup(&mut self, now: Instant) {
        self.total.retain(|slot| slot.expires_at >= now);
        self.peers.retain(|_, slots| {
            slots.retain(|expires_at| *expires_at >= now);
            !slots.is_empty()
        });
        self.prefixes.retain(|_, slots| {
            slots.retain(|slot| slot.expires_at >= now);
            !slots.is_empty()
        });
        self.asns.retain(|_, slots| {
            slots.retain(|slot| slot.expires_at >= now);
            !slots.is_empty()
        });
    }

    #[cfg(test)]
    fn total_slots(&self) -> usize {
        self.total.len()
    }
}

/// The first IP component of a multiaddr, if any.
fn multiaddr_ip(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|proto| match proto {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn resources() -> Resources {
        Resources {
            max_reservations: 4,
            max_reservations_per_peer: 1,
            max_reservations_per_ip: 2,
            max_reservations_per_asn: 2,
            ..Resources::default()
        }
    }

    fn addr(last_octet: u8) -> Multiaddr {
        format!("/ip4/1.2.3.{last_octet}/tcp/4001").parse().unwrap()
    }

    fn table(rc: &Resources) -> ConstraintTable {
        ConstraintTable::new(rc, None)
    }

    #[test]
    fn test_admits_within_caps() {
        let rc = resources();
        let mut t = table(&rc);
        let now = Instant::now();
        let expiry = now + Duration::from_secs(60);

        t.reserve(PeerId::random(), &addr(1), expiry, now).unwrap();
        t.reserve(
            PeerId::random(),
            &"/ip4/9.9.9.9/tcp/1".parse().unwrap(),
            expiry,
            now,
        )
        .unwrap();
        assert_eq!(t.total_slots(), 2);
    }

    #[test]
    fn test_total_cap() {
        let rc = Resources {
            max_reservations: 2,
            max_reservations_per_ip: 10,
            ..resources()
        };
        let mut t = table(&rc);
        let now = Instant::now();
        let expiry = now + Duration::from_secs(60);

        t.reserve(PeerId::random(), &addr(1), expiry, now).unwrap();
        t.reserve(PeerId::random(), &addr(2), expiry, now).unwrap();
        let err = t
            .reserve(PeerId::random(), &addr(3), expiry, now)
            .unwrap_err();
        assert_eq!(err, ConstraintViolation::TooManyReservations);
    }

    #[test]
    fn test_ip_prefix_cap_groups_v4_by_slash24() {
        let rc = resources();
        let mut t = table(&rc);
        let now = Instant::now();
        let expiry = now + Duration::from_secs(60);

        // Three distinct addresses in the same /24.
        t.reserve(PeerId::random(), &addr(1), expiry, now).unwrap();
        t.reserve(PeerId::random(), &addr(2), expiry, now).unwrap();
        let err = t
            .reserve(PeerId::random(), &addr(3), expiry, now)
            .unwrap_err();
        assert_eq!(err, ConstraintViolation::IpLimit);

        // A different /24 is unaffected.
        t.reserve(
            PeerId::random(),
            &"/ip4/1.2.4.1/tcp/4001".parse().unwrap(),
            expiry,
            now,
        )
        .unwrap();
    }

    #[test]
    fn test_refresh_does_not_grow_counts() {
        let rc = resources();
        let mut t = table(&rc);
        let now = Instant::now();
        let expiry = now + Duration::from_secs(60);
        let p = PeerId::random();

        t.reserve(p, &addr(1), expiry, now).unwrap();
        // Re-reserving the same peer replaces its slot even though the /24
        // cap is 2 and the per-peer cap is 1.
        t.reserve(p, &addr(1), expiry + Duration::from_secs(60), now)
            .unwrap();
        t.reserve(p, &addr(1), expiry + Duration::from_secs(120), now)
            .unwrap();

        assert_eq!(t.total_slots(), 1);
        assert_eq!(t.prefixes.values().map(Vec::len).sum::<usize>(), 1);
    }

    #[test]
    fn test_expired_slots_reclaimed_lazily() {
        let rc = Resources {
            max_reservations: 1,
            ..resources()
        };
        let mut t = table(&rc);
        let now = Instant::now();

        t.reserve(PeerId::random(), &addr(1), now + Duration::from_millis(10), now)
            .unwrap();

        // At a later "now" the expired slot no longer counts.
        let later = now + Duration::from_secs(1);
        t.reserve(
            PeerId::random(),
            &addr(2),
            later + Duration::from_secs(60),
            later,
        )
        .unwrap();
        assert_eq!(t.total_slots(), 1);
    }

    #[test]
    fn test_rejects_address_without_ip() {
        let rc = resources();
        let mut t = table(&rc);
        let now = Instant::now();

        let err = t
            .reserve(
                PeerId::random(),
                &"/dns4/example.com/tcp/443".parse().unwrap(),
                now + Duration::from_secs(60),
                now,
            )
            .unwrap_err();
        assert_eq!(err, ConstraintViolation::NoIpAddress);
    }

    #[test]
    fn test_asn_cap() {
        struct OneAsn;
        impl AsnResolver for OneAsn {
            fn asn(&self, _ip: IpAddr) -> Option<u32> {
                Some(64512)
            }
        }

        let rc = Resources {
            max_reservations_per_ip: 10,
            max_reservations_per_asn: 2,
            ..resources()
        };
        let mut t = ConstraintTable::new(&rc, Some(Arc::new(OneAsn)));
        let now = Instant::now();
        let expiry = now + Duration::from_secs(60);

        t.reserve(PeerId::random(), &addr(1), expiry, now).unwrap();
        t.reserve(PeerId::random(), &addr(2), expiry, now).unwrap();
        let err = t
            .reserve(PeerId::random(), &addr(3), expiry, now)
            .unwrap_err();
        assert_eq!(err, ConstraintViolation::AsnLimit);
    }

    #[test]
    fn test_cleanup_peer_releases_all_buckets() {
        let rc = resources();
        let mut t = table(&rc);
        let now = Instant::now();
        let expiry = now + Duration::from_secs(60);
        let p = PeerId::random();

        t.reserve(p, &addr(1), expiry, now).unwrap();
        t.cleanup_peer(&p);

        assert_eq!(t.total_slots(), 0);
        assert!(t.peers.is_empty());
        assert!(t.prefixes.is_empty());
        assert!(t.asns.is_empty());
    }

    #[test]
    fn test_v6_prefix_grouping() {
        let a: Multiaddr = "/ip6/2001:db8:1:1::1/tcp/1".parse().unwrap();
        let b: Multiaddr = "/ip6/2001:db8:1:2::1/tcp/1".parse().unwrap();
        let same_as_a: Multiaddr = "/ip6/2001:db8:1:ffff::9/tcp/1".parse().unwrap();

        let pa = IpPrefix::of(multiaddr_ip(&a).unwrap());
        let pb = IpPrefix::of(multiaddr_ip(&b).unwrap());
        let pa2 = IpPrefix::of(multiaddr_ip(&same_as_a).unwrap());

        // /48 boundary: 2001:db8:1 is one prefix regardless of later groups.
        assert_eq!(pa, pb);
        assert_eq!(pa, pa2);

        let other: Multiaddr = "/ip6/2001:db8:2::1/tcp/1".parse().unwrap();
        assert_ne!(pa, IpPrefix::of(multiaddr_ip(&other).unwrap()));
    }
}
