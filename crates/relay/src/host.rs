//! Collaborator contracts.
//!
//! The relay does not own a network stack. It consumes a [`RelayHost`] that
//! accepts and opens protocol streams, reports connectivity, and tags peers
//! in its connection manager; streams come with a [`StreamControl`] handle
//! so either pump task can abort a circuit; memory budgets go through the
//! [`ResourceManager`] scope-span contract.

use std::io;
use std::sync::Arc;

use futures::future::BoxFuture;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// A bidirectional protocol stream.
///
/// `AsyncWrite::poll_shutdown` is the half-close: it flushes and signals
/// end-of-stream to the peer without touching the read side. Abortive close
/// and read-close go through the [`StreamControl`] handle, which stays
/// usable after the stream has been split into halves.
pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// A handle for out-of-band control of this stream.
    fn control(&self) -> Arc<dyn StreamControl>;
}

/// Out-of-band stream control, cloneable across tasks.
pub trait StreamControl: Send + Sync {
    /// Abortively close both directions, signaling an error to the peer.
    fn reset(&self);

    /// Close the read side, discarding any further inbound data.
    fn close_read(&self);
}

pub type BoxStream = Box<dyn RelayStream>;

/// An inbound stream delivered by the host, with its connection metadata.
pub struct InboundStream {
    pub stream: BoxStream,
    /// The remote peer on the underlying connection.
    pub peer: PeerId,
    /// The remote multiaddr the connection was accepted from.
    pub addr: Multiaddr,
}

/// The host the relay runs on.
///
/// Tagging methods mirror a connection-manager contract: a tag names a
/// reason to keep the peer's connection alive, with a relative weight.
pub trait RelayHost: Send + Sync + 'static {
    fn local_peer_id(&self) -> PeerId;

    /// The host's identity key, used to seal reservation vouchers.
    fn keypair(&self) -> libp2p::identity::Keypair;

    /// Addresses the host is reachable at, before public filtering.
    fn listen_addrs(&self) -> Vec<Multiaddr>;

    /// Whether the host currently has a live connection to `peer`.
    fn is_connected(&self, peer: &PeerId) -> bool;

    fn tag_peer(&self, peer: &PeerId, tag: &'static str, weight: u32);

    fn untag_peer(&self, peer: &PeerId, tag: &'static str);

    /// Deliver inbound streams for `protocol` into `inbound` until the
    /// handler is removed.
    fn set_protocol_handler(&self, protocol: StreamProtocol, inbound: mpsc::Sender<InboundStream>);

    fn remove_protocol_handler(&self, protocol: StreamProtocol);

    /// Subscribe to fully-disconnected notifications. Transient connection
    /// drops may be reported; subscribers re-check connectedness.
    fn subscribe_disconnects(&self) -> mpsc::Receiver<PeerId>;

    /// Open an outbound stream on `protocol` over an *existing* connection
    /// to `peer`. Implementations must not dial.
    fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> BoxFuture<'_, io::Result<BoxStream>>;

    /// The resource manager accounting for this host's memory.
    fn resource_manager(&self) -> Arc<dyn ResourceManager> {
        Arc::new(NoopResourceManager)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    #[error("memory limit exceeded")]
    MemoryLimitExceeded,

    #[error("resource scope closed")]
    ScopeClosed,
}

/// Priority of a memory reservation; higher priorities may be admitted when
/// lower ones are refused under pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPriority {
    Low,
    Medium,
    High,
    Always,
}

/// Scoped resource accounting.
pub trait ResourceManager: Send + Sync {
    /// Open the span that accounts for a named service.
    fn service_span(&self, service: &'static str) -> Result<Box<dyn ResourceSpan>, ResourceError>;
}

/// A resource span. Reservations made on a span are released individually
/// with [`ResourceSpan::release_memory`] or collectively when the span is
/// dropped; dropping is how a span is closed, so it closes exactly once.
pub trait ResourceSpan: Send + Sync {
    /// Open a child span whose reservations release together.
    fn begin_span(&self) -> Result<Box<dyn ResourceSpan>, ResourceError>;

    fn reserve_memory(&self, bytes: usize, priority: MemoryPriority) -> Result<(), ResourceError>;

    fn release_memory(&self, bytes: usize);
}

/// RAII memory reservation: releases on drop, so every exit path of a
/// handler gives the bytes back.
pub struct MemoryGuard {
    span: Arc<dyn ResourceSpan>,
    bytes: usize,
}

impl MemoryGuard {
    pub fn reserve(
        span: &Arc<dyn ResourceSpan>,
        bytes: usize,
        priority: MemoryPriority,
    ) -> Result<Self, ResourceError> {
        span.reserve_memory(bytes, priority)?;
        Ok(Self {
            span: span.clone(),
            bytes,
        })
    }
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        self.span.release_memory(self.bytes);
    }
}

/// Resource manager that admits everything.
pub struct NoopResourceManager;

impl ResourceManager for NoopResourceManager {
    fn service_span(&self, _service: &'static str) -> Result<Box<dyn ResourceSpan>, ResourceError> {
        Ok(Box::new(NoopSpan))
    }
}

struct NoopSpan;

impl ResourceSpan for NoopSpan {
    fn begin_span(&self) -> Result<Box<dyn ResourceSpan>, ResourceError> {
        Ok(Box::new(NoopSpan))
    }

    fn reserve_memory(&self, _bytes: usize, _priority: MemoryPriority) -> Result<(), ResourceError> {
        Ok(())
    }

    fn release_memory(&self, _bytes: usize) {}
}
