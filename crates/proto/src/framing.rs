//! Length-delimited message framing.
//!
//! Every protocol message travels as an unsigned varint length prefix
//! followed by the bincode-encoded body. Receivers enforce a hard cap of
//! [`MAX_MESSAGE_SIZE`] bytes and reject oversize frames before reading the
//! body.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtoError, Result};

/// Hard cap on the encoded size of a single protocol message.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Read one length-delimited message from `io`.
pub async fn read_message<T, S>(io: &mut S) -> Result<T>
where
    T: DeserializeOwned,
    S: AsyncRead + Unpin,
{
    let len = read_length_prefix(io).await?;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtoError::Oversize {
            len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    io.read_exact(&mut body).await.map_err(map_eof)?;

    Ok(bincode::deserialize(&body)?)
}

/// Write one length-delimited message to `io` and flush it.
pub async fn write_message<T, S>(io: &mut S, msg: &T) -> Result<()>
where
    T: Serialize,
    S: AsyncWrite + Unpin,
{
    let body = bincode::serialize(msg)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ProtoError::Oversize {
            len: body.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut prefix = unsigned_varint::encode::usize_buffer();
    let prefix = unsigned_varint::encode::usize(body.len(), &mut prefix);

    io.write_all(prefix).await?;
    io.write_all(&body).await?;
    io.flush().await?;
    Ok(())
}

/// Read a varint length prefix one byte at a time.
async fn read_length_prefix<S: AsyncRead + Unpin>(io: &mut S) -> Result<usize> {
    let mut buf = unsigned_varint::encode::usize_buffer();
    for i in 0..buf.len() {
        let mut byte = [0u8; 1];
        io.read_exact(&mut byte).await.map_err(map_eof)?;
        buf[i] = byte[0];
        if byte[0] & 0x80 == 0 {
            let (len, _) = unsigned_varint::decode::usize(&buf[..=i])
                .map_err(|_| ProtoError::BadLengthPrefix)?;
            return Ok(len);
        }
    }
    Err(ProtoError::BadLengthPrefix)
}

fn map_eof(err: std::io::Error) -> ProtoError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtoError::UnexpectedEof
    } else {
        ProtoError::Io(err)
    }
}
