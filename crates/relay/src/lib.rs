//! SpliceNet limited circuit relay.
//!
//! A hop relay lets two peers exchange bytes through a third party when
//! they cannot connect directly. A destination peer *reserves* a slot; a
//! source peer then asks the relay to *connect*, and the relay splices the
//! source's stream onto a fresh stream to the destination, enforcing
//! per-peer circuit quotas and optional per-circuit byte/time caps.
//!
//! The service runs against a [`RelayHost`] — the contract for accepting
//! and opening protocol streams, connection-manager tagging, and resource
//! accounting. It never dials: circuits only reach destinations that are
//! already connected and reserved.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use splicenet_relay::{Relay, RelayHost, Resources};
//! # async fn run(host: Arc<dyn RelayHost>) -> splicenet_relay::Result<()> {
//! let relay = Relay::builder(host)
//!     .resources(Resources::default())
//!     .build()?;
//! // ... serve until told otherwise ...
//! relay.close().await;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use libp2p::StreamProtocol;

mod acl;
mod circuit;
mod config;
mod constraints;
mod counter;
mod error;
mod handler;
mod host;
mod metrics;
mod pump;
mod reservations;
mod service;
mod voucher;

pub use acl::AclFilter;
pub use config::{CircuitLimit, Resources};
pub use constraints::AsnResolver;
pub use error::{RelayError, Result};
pub use host::{
    BoxStream, InboundStream, MemoryGuard, MemoryPriority, NoopResourceManager, RelayHost,
    RelayStream, ResourceError, ResourceManager, ResourceSpan, StreamControl,
};
pub use metrics::MetricsTracer;
pub use service::{Relay, RelayBuilder};

/// Name under which the relay attaches to the host's resource manager.
pub const SERVICE_NAME: &str = "libp2p.relay/v2";

/// Protocol spoken by sources towards the relay.
pub const HOP_PROTOCOL: StreamProtocol = StreamProtocol::new("/libp2p/circuit/relay/0.2.0/hop");

/// Protocol spoken by the relay towards reserved destinations.
pub const STOP_PROTOCOL: StreamProtocol = StreamProtocol::new("/libp2p/circuit/relay/0.2.0/stop");

/// Connection-manager tag for peers holding a reservation.
pub const RESERVATION_TAG: &str = "relay-reservation";
pub const RESERVATION_TAG_WEIGHT: u32 = 10;

/// Connection-manager tag for peers with at least one active circuit.
pub const HOP_TAG: &str = "relay-v2-hop";
pub const HOP_TAG_WEIGHT: u32 = 2;

/// Deadline for reading or writing a single protocol message.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for opening the stop stream to the destination.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the whole stop handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Cadence of the background expiry sweeper.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
