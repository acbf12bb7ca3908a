//! Relay resource configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-circuit byte and time caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitLimit {
    /// Maximum lifetime of a circuit.
    #[serde(default = "default_limit_duration")]
    pub duration: Duration,

    /// Maximum bytes relayed in each direction.
    #[serde(default = "default_limit_data")]
    pub data: u64,
}

fn default_limit_duration() -> Duration {
    Duration::from_secs(2 * 60)
}

fn default_limit_data() -> u64 {
    1 << 17 // 128 KiB
}

impl Default for CircuitLimit {
    fn default() -> Self {
        Self {
            duration: default_limit_duration(),
            data: default_limit_data(),
        }
    }
}

/// Resource budget of the relay service. Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resources {
    /// Lifetime of a reservation slot.
    #[serde(default = "default_reservation_ttl")]
    pub reservation_ttl: Duration,

    /// Total concurrent reservations across all peers.
    #[serde(default = "default_max_reservations")]
    pub max_reservations: usize,

    /// Active circuits per peer, counted for both the source and the
    /// destination role.
    #[serde(default = "default_max_circuits")]
    pub max_circuits: usize,

    /// Copy buffer per pump direction; a circuit reserves twice this.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Per-circuit caps, or `None` for unlimited circuits.
    #[serde(default = "default_limit")]
    pub limit: Option<CircuitLimit>,

    /// Reservation slots a single peer may hold.
    #[serde(default = "default_max_reservations_per_peer")]
    pub max_reservations_per_peer: usize,

    /// Reservation slots per IP prefix (/24 for v4, /48 for v6).
    #[serde(default = "default_max_reservations_per_ip")]
    pub max_reservations_per_ip: usize,

    /// Reservation slots per autonomous system, when ASN data is available.
    #[serde(default = "default_max_reservations_per_asn")]
    pub max_reservations_per_asn: usize,
}

fn default_reservation_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_max_reservations() -> usize {
    128
}

fn default_max_circuits() -> usize {
    16
}

fn default_buffer_size() -> usize {
    2048
}

fn default_limit() -> Option<CircuitLimit> {
    Some(CircuitLimit::default())
}

fn default_max_reservations_per_peer() -> usize {
    4
}

fn default_max_reservations_per_ip() -> usize {
    8
}

fn default_max_reservations_per_asn() -> usize {
    32
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            reservation_ttl: default_reservation_ttl(),
            max_reservations: default_max_reservations(),
            max_circuits: default_max_circuits(),
            buffer_size: default_buffer_size(),
            limit: default_limit(),
            max_reservations_per_peer: default_max_reservations_per_peer(),
            max_reservations_per_ip: default_max_reservations_per_ip(),
            max_reservations_per_asn: default_max_reservations_per_asn(),
        }
    }
}

impl Resources {
    /// Resources with no per-circuit byte/time caps.
    pub fn unlimited() -> Self {
        Self {
            limit: None,
            ..Self::default()
        }
    }

    /// The limit advertised on the wire, if any.
    pub(crate) fn limit_msg(&self) -> Option<splicenet_proto::Limit> {
        self.limit.map(|l| splicenet_proto::Limit {
            duration: l.duration.as_secs() as u32,
            data: l.data,
        })
    }
}
