//! Signed reservation vouchers.
//!
//! A voucher is the relay's proof that it agreed to forward circuits to a
//! peer until an expiration time. The record is sealed in a signed envelope
//! under the relay's identity key; anyone holding the relay's public key can
//! verify it offline.

use libp2p::core::SignedEnvelope;
use libp2p::identity::Keypair;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};

/// Domain separation string for voucher envelopes.
pub const VOUCHER_DOMAIN: &str = "libp2p-relay-rsvp";

/// Payload type identifying voucher records inside an envelope.
pub const VOUCHER_PAYLOAD_TYPE: &[u8] = &[0x03, 0x02];

/// The record sealed inside a reservation voucher envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationVoucher {
    /// The relay granting the reservation.
    pub relay: Vec<u8>,
    /// The peer allowed to be reached through the relay.
    pub peer: Vec<u8>,
    /// Unix seconds at which the voucher lapses.
    pub expiration: u64,
}

impl ReservationVoucher {
    pub fn new(relay: &PeerId, peer: &PeerId, expiration: u64) -> Self {
        Self {
            relay: relay.to_bytes(),
            peer: peer.to_bytes(),
            expiration,
        }
    }

    /// Decode the relay's peer id.
    pub fn relay(&self) -> Result<PeerId> {
        PeerId::from_bytes(&self.relay).map_err(|_| ProtoError::InvalidPeerId)
    }

    /// Decode the reserved peer's id.
    pub fn peer(&self) -> Result<PeerId> {
        PeerId::from_bytes(&self.peer).map_err(|_| ProtoError::InvalidPeerId)
    }

    /// Seal the record under `key`, producing the envelope wire bytes.
    ///
    /// `key` must be the identity key of the relay named in the record.
    pub fn seal(&self, key: &Keypair) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let envelope = SignedEnvelope::new(
            key,
            VOUCHER_DOMAIN.to_string(),
            VOUCHER_PAYLOAD_TYPE.to_vec(),
            payload,
        )?;
        Ok(envelope.into_protobuf_encoding())
    }

    /// Open an envelope, verify its signature, and check that the signer is
    /// the relay named in the record.
    pub fn unseal(bytes: &[u8]) -> Result<Self> {
        let envelope = SignedEnvelope::from_protobuf_encoding(bytes)
            .map_err(|e| ProtoError::Envelope(e.to_string()))?;
        let (payload, signer) = envelope
            .payload_and_signing_key(VOUCHER_DOMAIN.to_string(), VOUCHER_PAYLOAD_TYPE)
            .map_err(|e| ProtoError::Envelope(e.to_string()))?;

        let voucher: ReservationVoucher = bincode::deserialize(payload)?;
        if signer.to_peer_id() != voucher.relay()? {
            return Err(ProtoError::Envelope(
                "envelope not signed by the relay named in the voucher".to_string(),
            ));
        }
        Ok(voucher)
    }
}
