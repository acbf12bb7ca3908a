//! Hop and stop protocol messages.
//!
//! The hop protocol runs between a source peer and the relay; the stop
//! protocol runs between the relay and a reserved destination. Peer ids and
//! multiaddrs travel as raw bytes and are validated by the typed accessors,
//! so a corrupt field is a decode failure rather than a panic.

use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};

/// Terminal status of a hop or stop exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    ReservationRefused,
    ResourceLimitExceeded,
    PermissionDenied,
    ConnectionFailed,
    NoReservation,
    MalformedMessage,
}

/// Peer info carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Peer id bytes.
    pub id: Vec<u8>,
    /// Multiaddr bytes, possibly empty.
    pub addrs: Vec<Vec<u8>>,
}

impl Peer {
    /// Wrap a peer id with no addresses.
    pub fn from_peer_id(id: &PeerId) -> Self {
        Self {
            id: id.to_bytes(),
            addrs: Vec::new(),
        }
    }

    /// Decode the peer id field.
    pub fn peer_id(&self) -> Result<PeerId> {
        PeerId::from_bytes(&self.id).map_err(|_| ProtoError::InvalidPeerId)
    }

    /// Decode the address list, rejecting any malformed entry.
    pub fn multiaddrs(&self) -> Result<Vec<Multiaddr>> {
        self.addrs
            .iter()
            .map(|bytes| {
                Multiaddr::try_from(bytes.clone()).map_err(|_| ProtoError::InvalidAddr)
            })
            .collect()
    }
}

/// Reservation granted by the relay, carried in an OK hop response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Unix seconds at which the reservation lapses.
    pub expire: u64,
    /// Public addresses of the relay, each carrying its peer id component.
    pub addrs: Vec<Vec<u8>>,
    /// Sealed voucher envelope, if sealing succeeded.
    pub voucher: Option<Vec<u8>>,
}

/// Per-circuit limits advertised by the relay. Omitted entirely when the
/// relay applies no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    /// Maximum circuit lifetime in seconds.
    pub duration: u32,
    /// Maximum bytes relayed in each direction.
    pub data: u64,
}

/// Messages on the hop protocol (source ⇄ relay).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopMessage {
    /// Destination asks to be reachable through the relay.
    Reserve,
    /// Source asks for a circuit to a reserved destination.
    Connect { peer: Peer },
    /// Relay's response to either request.
    Status {
        status: Status,
        reservation: Option<Reservation>,
        limit: Option<Limit>,
    },
}

impl HopMessage {
    /// A bare status response with no reservation or limit attached.
    pub fn status(status: Status) -> Self {
        HopMessage::Status {
            status,
            reservation: None,
            limit: None,
        }
    }
}

/// Messages on the stop protocol (relay ⇄ destination).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopMessage {
    /// Relay announces an incoming circuit from `peer`.
    Connect { peer: Peer, limit: Option<Limit> },
    /// Destination's answer.
    Status { status: Status },
}
