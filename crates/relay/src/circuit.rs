//! Circuit establishment.
//!
//! Takes over after CONNECT admission: opens the stop stream to the
//! reserved destination, performs the stop handshake, confirms to the
//! source, and starts the two pumps. Teardown is a rendezvous between the
//! pumps — whichever finishes last runs the single cleanup that releases
//! the circuit's span and both quota slots.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use libp2p::PeerId;
use tokio::time;
use tracing::{debug, info};

use splicenet_proto::{
    read_message, write_message, HopMessage, Peer, Status, StopMessage, MAX_MESSAGE_SIZE,
};

use crate::handler::handle_error;
use crate::host::{BoxStream, MemoryGuard, MemoryPriority, ResourceSpan};
use crate::pump::pump;
use crate::service::RelayInner;
use crate::{CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, STOP_PROTOCOL, STREAM_TIMEOUT};

/// Rendezvous of the two pump tasks. The last party to call [`done`]
/// runs the cleanup, exactly once.
///
/// [`done`]: Teardown::done
pub(crate) struct Teardown {
    remaining: AtomicU32,
    cleanup: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Teardown {
    pub fn new(parties: u32, cleanup: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicU32::new(parties),
            cleanup: Mutex::new(Some(Box::new(cleanup))),
        })
    }

    pub fn done(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(cleanup) = self.cleanup.lock().unwrap().take() {
                cleanup();
            }
        }
    }
}

/// Everything an admitted circuit must give back, run exactly once.
pub(crate) struct CircuitCleanup {
    pub inner: Arc<RelayInner>,
    pub src: PeerId,
    pub dest: PeerId,
    pub span: Box<dyn ResourceSpan>,
    pub opened_at: Instant,
}

impl CircuitCleanup {
    pub fn run(self) {
        self.inner.release_circuit(&self.src, &self.dest);
        if let Some(metrics) = &self.inner.metrics {
            metrics.connection_closed(self.opened_at.elapsed());
        }
        // span drops here, releasing the circuit's buffer reservation
    }
}

/// Steps 6–10 of circuit admission: stop stream, handshake, confirmation,
/// pumps. Any failure releases everything accrued so far and answers the
/// source with the returned status.
pub(crate) async fn establish(
    inner: Arc<RelayInner>,
    mut src_stream: BoxStream,
    src: PeerId,
    dest: PeerId,
    cleanup: CircuitCleanup,
) -> Status {
    // Open the stop stream over an existing connection only; the
    // destination reserved, so it is expected to be connected.
    let mut dest_stream =
        match time::timeout(CONNECT_TIMEOUT, inner.host.open_stream(dest, STOP_PROTOCOL)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!("error opening relay stream to {dest}: {err}");
                cleanup.run();
                handle_error(&mut src_stream, Status::ConnectionFailed).await;
                return Status::ConnectionFailed;
            }
            Err(_) => {
                debug!("timed out opening relay stream to {dest}");
                cleanup.run();
                handle_error(&mut src_stream, Status::ConnectionFailed).await;
                return Status::ConnectionFailed;
            }
        };

    // Handshake messages count against the service scope, like the hop
    // stream's own message memory.
    let _dest_mem = match MemoryGuard::reserve(
        &inner.service_span,
        MAX_MESSAGE_SIZE,
        MemoryPriority::Always,
    ) {
        Ok(guard) => guard,
        Err(err) => {
            debug!("error reserving memory for stop stream: {err}");
            dest_stream.control().reset();
            cleanup.run();
            handle_error(&mut src_stream, Status::ResourceLimitExceeded).await;
            return Status::ResourceLimitExceeded;
        }
    };

    // Stop handshake, bounded as a whole.
    let handshake_deadline = time::Instant::now() + HANDSHAKE_TIMEOUT;
    let stop_connect = StopMessage::Connect {
        peer: Peer::from_peer_id(&src),
        limit: inner.resources.limit_msg(),
    };

    let wrote = time::timeout_at(
        handshake_deadline,
        write_message(&mut dest_stream, &stop_connect),
    )
    .await;
    if !matches!(wrote, Ok(Ok(()))) {
        debug!("error writing stop handshake to {dest}");
        dest_stream.control().reset();
        cleanup.run();
        handle_error(&mut src_stream, Status::ConnectionFailed).await;
        return Status::ConnectionFailed;
    }

    let answer =
        time::timeout_at(handshake_deadline, read_message::<StopMessage, _>(&mut dest_stream))
            .await;
    match answer {
        Ok(Ok(StopMessage::Status { status: Status::Ok })) => {}
        Ok(Ok(StopMessage::Status { status })) => {
            debug!("relay stop failure: {status:?}");
            dest_stream.control().reset();
            cleanup.run();
            handle_error(&mut src_stream, Status::ConnectionFailed).await;
            return Status::ConnectionFailed;
        }
        Ok(Ok(_)) => {
            debug!("unexpected stop response: not a status message");
            dest_stream.control().reset();
            cleanup.run();
            handle_error(&mut src_stream, Status::ConnectionFailed).await;
            return Status::ConnectionFailed;
        }
        _ => {
            debug!("error reading stop response from {dest}");
            dest_stream.control().reset();
            cleanup.run();
            handle_error(&mut src_stream, Status::ConnectionFailed).await;
            return Status::ConnectionFailed;
        }
    }

    // Confirm to the source. A failure here resets both sides; the source
    // never learns a status from a stream we can no longer write to.
    let response = HopMessage::Status {
        status: Status::Ok,
        reservation: None,
        limit: inner.resources.limit_msg(),
    };
    let confirmed = time::timeout(STREAM_TIMEOUT, write_message(&mut src_stream, &response)).await;
    if !matches!(confirmed, Ok(Ok(()))) {
        debug!("error writing relay response to {src}");
        dest_stream.control().reset();
        src_stream.control().reset();
        cleanup.run();
        return Status::ConnectionFailed;
    }

    info!("relaying connection from {src} to {dest}");

    let (data_cap, deadline) = match inner.resources.limit {
        Some(limit) => (
            Some(limit.data),
            Some(time::Instant::now() + limit.duration),
        ),
        None => (None, None),
    };

    let src_ctl = src_stream.control();
    let dest_ctl = dest_stream.control();
    let (src_read, src_write) = tokio::io::split(src_stream);
    let (dest_read, dest_write) = tokio::io::split(dest_stream);

    let teardown = Teardown::new(2, move || cleanup.run());

    {
        let teardown = teardown.clone();
        let pool = inner.pool.clone();
        let metrics = inner.metrics.clone();
        let (src_ctl, dest_ctl) = (src_ctl.clone(), dest_ctl.clone());
        tokio::spawn(async move {
            pump(
                src_read, dest_write, src, dest, src_ctl, dest_ctl, pool, data_cap, deadline,
                metrics,
            )
            .await;
            teardown.done();
        });
    }
    {
        let pool = inner.pool.clone();
        let metrics = inner.metrics.clone();
        tokio::spawn(async move {
            pump(
                dest_read, src_write, dest, src, dest_ctl, src_ctl, pool, data_cap, deadline,
                metrics,
            )
            .await;
            teardown.done();
        });
    }

    Status::Ok
}
