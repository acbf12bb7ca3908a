//! Hop stream handling.
//!
//! One inbound hop stream is handled end-to-end: read a single request
//! under the stream timeout, dispatch RESERVE or CONNECT, write a status
//! response. Handling never fails visibly — every outcome is a status on
//! the wire (or a reset when even that cannot be written) plus a metrics
//! event.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tokio::io::AsyncWriteExt;
use tokio::time;
use tracing::{debug, info};

use splicenet_proto::{
    read_message, write_message, HopMessage, Peer, ProtoError, Status, MAX_MESSAGE_SIZE,
};

use crate::circuit::{establish, CircuitCleanup};
use crate::host::{BoxStream, InboundStream, MemoryGuard, MemoryPriority};
use crate::service::RelayInner;
use crate::voucher::make_reservation;
use crate::{HOP_TAG, HOP_TAG_WEIGHT, RESERVATION_TAG, RESERVATION_TAG_WEIGHT, STREAM_TIMEOUT};

/// Entry point for one inbound hop stream.
pub(crate) async fn handle_stream(inner: Arc<RelayInner>, inbound: InboundStream) {
    let InboundStream {
        mut stream,
        peer,
        addr,
    } = inbound;

    info!("new relay stream from {peer}");

    let _msg_mem = match MemoryGuard::reserve(
        &inner.service_span,
        MAX_MESSAGE_SIZE,
        MemoryPriority::Always,
    ) {
        Ok(guard) => guard,
        Err(err) => {
            debug!("error reserving memory for stream: {err}");
            stream.control().reset();
            return;
        }
    };

    let msg = match time::timeout(STREAM_TIMEOUT, read_message::<HopMessage, _>(&mut stream)).await
    {
        Ok(Ok(msg)) => msg,
        Ok(Err(err)) => {
            debug!("error reading relay request from {peer}: {err}");
            handle_error(&mut stream, Status::MalformedMessage).await;
            return;
        }
        Err(_) => {
            debug!("timed out reading relay request from {peer}");
            handle_error(&mut stream, Status::MalformedMessage).await;
            return;
        }
    };

    match msg {
        HopMessage::Reserve => {
            let status = handle_reserve(&inner, stream, peer, addr).await;
            if let Some(metrics) = &inner.metrics {
                metrics.reservation_request_handled(status);
            }
        }
        HopMessage::Connect { peer: dest_info } => {
            let status = handle_connect(&inner, stream, peer, addr, dest_info).await;
            if let Some(metrics) = &inner.metrics {
                metrics.connection_request_handled(status);
            }
        }
        HopMessage::Status { .. } => {
            handle_error(&mut stream, Status::MalformedMessage).await;
        }
    }
}

/// RESERVE: admit the peer into the reservation table and answer with a
/// voucher. Returns the terminal status for metrics.
async fn handle_reserve(
    inner: &Arc<RelayInner>,
    mut stream: BoxStream,
    peer: PeerId,
    addr: Multiaddr,
) -> Status {
    if is_relay_addr(&addr) {
        debug!("refusing relay reservation for {peer}; reservation attempt over relay connection");
        handle_error(&mut stream, Status::PermissionDenied).await;
        return Status::PermissionDenied;
    }

    if let Some(acl) = &inner.acl {
        if !acl.allow_reserve(&peer, &addr) {
            debug!("refusing relay reservation for {peer}; permission denied");
            handle_error(&mut stream, Status::PermissionDenied).await;
            return Status::PermissionDenied;
        }
    }

    let expire_unix = unix_seconds_after(inner.resources.reservation_ttl);

    // Admission happens in one critical section; the guard must not live
    // across an await, so the outcome is carried out of the block.
    let admission: std::result::Result<bool, Status> = {
        let mut state = inner.state.lock().unwrap();
        if state.closed {
            // After close nothing would ever untag this peer.
            debug!("refusing relay reservation for {peer}; relay closed");
            Err(Status::PermissionDenied)
        } else {
            let now = Instant::now();
            let expires_at = now + inner.resources.reservation_ttl;
            let renewed = state.reservations.contains(&peer);
            match state.constraints.reserve(peer, &addr, expires_at, now) {
                Err(err) => {
                    debug!("refusing relay reservation for {peer}; {err}");
                    Err(Status::ReservationRefused)
                }
                Ok(()) => {
                    state.reservations.insert(peer, expires_at);
                    inner
                        .host
                        .tag_peer(&peer, RESERVATION_TAG, RESERVATION_TAG_WEIGHT);
                    Ok(renewed)
                }
            }
        }
    };

    let renewed = match admission {
        Ok(renewed) => renewed,
        Err(status) => {
            handle_error(&mut stream, status).await;
            return status;
        }
    };

    if let Some(metrics) = &inner.metrics {
        metrics.reservation_allowed(renewed);
    }
    debug!("reserving relay slot for {peer}");

    let reservation = make_reservation(
        &inner.host.keypair(),
        inner.host.local_peer_id(),
        inner.host.listen_addrs(),
        peer,
        expire_unix,
    );
    let response = HopMessage::Status {
        status: Status::Ok,
        reservation: Some(reservation),
        limit: inner.resources.limit_msg(),
    };

    // Delivery can fail if the peer goes away first. The reservation is
    // kept; it will be garbage-collected at TTL, and the peer can retry.
    if write_response(&mut stream, &response).await.is_err() {
        debug!("error writing reservation response for {peer}");
        stream.control().reset();
        return Status::ConnectionFailed;
    }

    let _ = stream.shutdown().await;
    Status::Ok
}

/// CONNECT admission (steps up to quota accounting), then hand-off to
/// [`establish`] for the stop handshake and the pumps.
async fn handle_connect(
    inner: &Arc<RelayInner>,
    mut stream: BoxStream,
    src: PeerId,
    addr: Multiaddr,
    dest_info: Peer,
) -> Status {
    let span = match inner.service_span.begin_span() {
        Ok(span) => span,
        Err(err) => {
            debug!("failed to begin relay transaction: {err}");
            handle_error(&mut stream, Status::ResourceLimitExceeded).await;
            return Status::ResourceLimitExceeded;
        }
    };

    // Both pump buffers are accounted up front.
    if let Err(err) = span.reserve_memory(2 * inner.resources.buffer_size, MemoryPriority::High) {
        debug!("error reserving memory for relay: {err}");
        handle_error(&mut stream, Status::ResourceLimitExceeded).await;
        return Status::ResourceLimitExceeded;
    }

    if is_relay_addr(&addr) {
        debug!("refusing connection from {src}; connection attempt over relay connection");
        handle_error(&mut stream, Status::PermissionDenied).await;
        return Status::PermissionDenied;
    }

    let dest = match dest_info.peer_id() {
        Ok(dest) => dest,
        Err(_) => {
            handle_error(&mut stream, Status::MalformedMessage).await;
            return Status::MalformedMessage;
        }
    };

    if let Some(acl) = &inner.acl {
        if !acl.allow_connect(&src, &addr, &dest) {
            debug!("refusing connection from {src} to {dest}; permission denied");
            handle_error(&mut stream, Status::PermissionDenied).await;
            return Status::PermissionDenied;
        }
    }

    // Reservation lookup and both quota increments are one critical
    // section; two racing CONNECTs serialize here.
    let admitted: std::result::Result<(), Status> = {
        let mut state = inner.state.lock().unwrap();
        if !state.reservations.contains(&dest) {
            debug!("refusing connection from {src} to {dest}; no reservation");
            Err(Status::NoReservation)
        } else if state.circuits.count(&src) >= inner.resources.max_circuits {
            debug!("refusing connection from {src} to {dest}; too many circuits from {src}");
            Err(Status::ResourceLimitExceeded)
        } else if state.circuits.count(&dest) >= inner.resources.max_circuits {
            debug!("refusing connection from {src} to {dest}; too many circuits to {dest}");
            Err(Status::ResourceLimitExceeded)
        } else {
            if state.circuits.add(src) {
                inner.host.tag_peer(&src, HOP_TAG, HOP_TAG_WEIGHT);
            }
            if state.circuits.add(dest) {
                inner.host.tag_peer(&dest, HOP_TAG, HOP_TAG_WEIGHT);
            }
            Ok(())
        }
    };

    if let Err(status) = admitted {
        handle_error(&mut stream, status).await;
        return status;
    }

    if let Some(metrics) = &inner.metrics {
        metrics.connection_opened();
    }

    let cleanup = CircuitCleanup {
        inner: inner.clone(),
        src,
        dest,
        span,
        opened_at: Instant::now(),
    };

    establish(inner.clone(), stream, src, dest, cleanup).await
}

/// Write a response under the stream timeout.
async fn write_response(stream: &mut BoxStream, msg: &HopMessage) -> splicenet_proto::Result<()> {
    match time::timeout(STREAM_TIMEOUT, write_message(stream, msg)).await {
        Ok(result) => result,
        Err(_) => Err(ProtoError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "response write timed out",
        ))),
    }
}

/// Answer with an error status. Closes the stream on success; resets it
/// when even the status cannot be delivered.
pub(crate) async fn handle_error(stream: &mut BoxStream, status: Status) {
    debug!("relay error: {status:?}");
    match write_response(stream, &HopMessage::status(status)).await {
        Ok(()) => {
            let _ = stream.shutdown().await;
        }
        Err(err) => {
            debug!("error writing relay response: {err}");
            stream.control().reset();
        }
    }
}

/// Whether an address goes through a circuit already — relayed connections
/// may not reserve or connect again.
fn is_relay_addr(addr: &Multiaddr) -> bool {
    addr.iter().any(|proto| matches!(proto, Protocol::P2pCircuit))
}

fn unix_seconds_after(ttl: Duration) -> u64 {
    (SystemTime::now() + ttl)
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
