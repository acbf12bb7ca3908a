//! Wire layer for the SpliceNet circuit relay.
//!
//! Defines the hop and stop protocol messages, the length-delimited framing
//! used to move them over a stream, and the signed reservation voucher a
//! relay hands out when it grants a slot.
//!
//! Everything here is transport-agnostic: messages are read from and written
//! to anything implementing the tokio `AsyncRead`/`AsyncWrite` traits.

mod error;
mod framing;
mod message;
mod voucher;

pub use error::{ProtoError, Result};
pub use framing::{read_message, write_message, MAX_MESSAGE_SIZE};
pub use message::{HopMessage, Limit, Peer, Reservation, Status, StopMessage};
pub use voucher::{ReservationVoucher, VOUCHER_DOMAIN, VOUCHER_PAYLOAD_TYPE};
