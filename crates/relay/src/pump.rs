//! Byte pumps.
//!
//! Each circuit runs two pumps, one per direction. A pump copies from its
//! source half to its destination half through a pooled buffer, optionally
//! capped at a byte budget and bounded by a wall-clock deadline. Errors are
//! abortive: both streams are reset. Clean end-of-stream propagates as a
//! half-close so the other direction keeps flowing.

use std::io;
use std::sync::{Arc, Mutex};

use libp2p::PeerId;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;
use tracing::debug;

use crate::host::StreamControl;
use crate::metrics::MetricsTracer;

/// Pool of fixed-size copy buffers, recycled across circuits.
pub(crate) struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> Vec<u8> {
        self.free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size])
    }

    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() == self.size {
            self.free.lock().unwrap().push(buf);
        }
    }
}

/// Copy bytes from `src` to `dst` until end-of-stream, the byte cap, the
/// deadline, or an error. Returns the number of bytes written.
///
/// On clean end-of-stream (or on reaching the cap) the write side of `dst`
/// is closed; when the cap was met exactly, the read side of `src` is also
/// closed to refuse further input. On any error both streams are reset.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn pump<R, W>(
    mut src: R,
    mut dst: W,
    from: PeerId,
    to: PeerId,
    src_ctl: Arc<dyn StreamControl>,
    dst_ctl: Arc<dyn StreamControl>,
    pool: Arc<BufferPool>,
    limit: Option<u64>,
    deadline: Option<time::Instant>,
    metrics: Option<Arc<dyn MetricsTracer>>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.get();
    let mut written = 0u64;

    let result = {
        let copy = copy_with_buffer(
            &mut src,
            &mut dst,
            &mut buf,
            limit,
            metrics.as_deref(),
            &mut written,
        );
        match deadline {
            Some(at) => match time::timeout_at(at, copy).await {
                Ok(res) => res,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "circuit time limit reached",
                )),
            },
            None => copy.await,
        }
    };

    match result {
        Ok(()) => {
            // Propagate the close.
            let _ = dst.shutdown().await;
            if limit.is_some_and(|cap| written == cap) {
                // Budget exhausted; discard further input.
                src_ctl.close_read();
            }
        }
        Err(err) => {
            debug!("relay copy error: {err}");
            src_ctl.reset();
            dst_ctl.reset();
        }
    }

    pool.put(buf);
    debug!("relayed {written} bytes from {from} to {to}");
    written
}

/// The copy loop. Reads at most the remaining budget, writes every byte
/// read, and reports each chunk to the metrics tracer. A write that makes
/// no progress fails the copy (`WriteZero`), as does any other io error;
/// end-of-stream and a spent budget end it cleanly.
async fn copy_with_buffer<R, W>(
    src: &mut R,
    dst: &mut W,
    buf: &mut [u8],
    limit: Option<u64>,
    metrics: Option<&dyn MetricsTracer>,
    written: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = limit.unwrap_or(u64::MAX);
    loop {
        if remaining == 0 {
            return Ok(());
        }
        let want = (buf.len() as u64).min(remaining) as usize;
        let n = src.read(&mut buf[..want]).await?;
        if n == 0 {
            return Ok(());
        }

        dst.write_all(&buf[..n]).await?;
        *written += n as u64;
        remaining -= n as u64;

        if let Some(m) = metrics {
            m.bytes_transferred(n);
        }
    }
}
