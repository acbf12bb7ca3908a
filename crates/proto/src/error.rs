use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("message of {len} bytes exceeds the {max}-byte limit")]
    Oversize { len: usize, max: usize },

    #[error("length prefix is not a valid varint")]
    BadLengthPrefix,

    #[error("stream ended mid-message")]
    UnexpectedEof,

    #[error("malformed message body: {0}")]
    Body(#[from] bincode::Error),

    #[error("invalid peer id in message")]
    InvalidPeerId,

    #[error("invalid multiaddr in message")]
    InvalidAddr,

    #[error("voucher signing failed: {0}")]
    Signing(#[from] libp2p::identity::SigningError),

    #[error("voucher envelope rejected: {0}")]
    Envelope(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
