//! Relay service lifecycle.
//!
//! [`Relay`] owns the shared tables and the three background tasks: the
//! accept loop feeding [`crate::handler::handle_stream`], the disconnect
//! hook, and the periodic expiry sweeper. Shutdown is idempotent and
//! deterministic: the sweeper is stopped before the final sweep runs.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use libp2p::PeerId;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use crate::acl::AclFilter;
use crate::config::Resources;
use crate::constraints::{AsnResolver, ConstraintTable};
use crate::counter::CircuitCounter;
use crate::error::Result;
use crate::handler;
use crate::host::{InboundStream, RelayHost, ResourceSpan};
use crate::metrics::MetricsTracer;
use crate::pump::BufferPool;
use crate::reservations::ReservationTable;
use crate::{HOP_PROTOCOL, HOP_TAG, RESERVATION_TAG, SERVICE_NAME, SWEEP_INTERVAL};

/// Mutable service state, all behind one lock. Critical sections are short
/// map operations; the lock is never held across io.
pub(crate) struct State {
    pub reservations: ReservationTable,
    pub circuits: CircuitCounter,
    pub constraints: ConstraintTable,
    pub closed: bool,
}

pub(crate) struct RelayInner {
    pub host: Arc<dyn RelayHost>,
    pub resources: Resources,
    pub acl: Option<Arc<dyn AclFilter>>,
    pub metrics: Option<Arc<dyn MetricsTracer>>,
    pub service_span: Arc<dyn ResourceSpan>,
    pub pool: Arc<BufferPool>,
    pub state: Mutex<State>,
}

impl RelayInner {
    /// Give back both quota slots of a finished circuit.
    pub(crate) fn release_circuit(&self, src: &PeerId, dest: &PeerId) {
        let mut state = self.state.lock().unwrap();
        if state.circuits.remove(src) {
            self.host.untag_peer(src, HOP_TAG);
        }
        if state.circuits.remove(dest) {
            self.host.untag_peer(dest, HOP_TAG);
        }
    }

    /// Expiry sweep. Once the relay is closed, everything is evicted.
    pub(crate) fn gc(&self) {
        let evicted = {
            let mut state = self.state.lock().unwrap();
            let evict_all = state.closed;
            let evicted = state.reservations.sweep(Instant::now(), evict_all);
            for peer in &evicted {
                self.host.untag_peer(peer, RESERVATION_TAG);
            }
            state.circuits.gc();
            evicted
        };

        if !evicted.is_empty() {
            debug!("swept {} reservations", evicted.len());
        }
        if let Some(metrics) = &self.metrics {
            metrics.reservations_closed(evicted.len());
        }
    }

    fn disconnected(&self, peer: PeerId) {
        // Only a fully disconnected peer loses its slot; the notification
        // may be about one of several connections.
        if self.host.is_connected(&peer) {
            return;
        }

        let held = {
            let mut state = self.state.lock().unwrap();
            let held = state.reservations.remove(&peer);
            state.constraints.cleanup_peer(&peer);
            held
        };

        if held {
            debug!("evicted reservation for disconnected peer {peer}");
            if let Some(metrics) = &self.metrics {
                metrics.reservations_closed(1);
            }
        }
    }
}

/// The relay service.
///
/// Constructed with [`Relay::builder`]; stopped with [`Relay::close`].
/// In-flight circuits outlive `close` until their streams end or their
/// limit fires, but nothing new is admitted after it.
pub struct Relay {
    inner: Arc<RelayInner>,
    disconnects: JoinHandle<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Relay {
    /// Start building a relay running on `host`.
    pub fn builder(host: Arc<dyn RelayHost>) -> RelayBuilder {
        RelayBuilder {
            host,
            resources: Resources::default(),
            acl: None,
            metrics: None,
            asn_resolver: None,
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.host.local_peer_id()
    }

    /// Number of live reservation slots.
    pub fn reservation_count(&self) -> usize {
        self.inner.state.lock().unwrap().reservations.len()
    }

    /// Whether `peer` currently holds a reservation.
    pub fn is_reserved(&self, peer: &PeerId) -> bool {
        self.inner.state.lock().unwrap().reservations.contains(peer)
    }

    /// Number of circuits `peer` participates in, in either role.
    pub fn circuit_count(&self, peer: &PeerId) -> usize {
        self.inner.state.lock().unwrap().circuits.count(peer)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    /// Run an expiry sweep now, in addition to the periodic one.
    pub fn sweep(&self) {
        self.inner.gc();
    }

    /// Shut the service down. Idempotent; the second call is a no-op.
    ///
    /// Stops accepting streams, stops the sweeper, then runs the final
    /// sweep that evicts and untags every reservation. The service span is
    /// released once the last in-flight handler drops its reservation.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }

        // Removing the handler drops the host's inbound sender; the accept
        // loop drains streams already queued (they are refused by the
        // closed flag) and then exits on its own.
        self.inner.host.remove_protocol_handler(HOP_PROTOCOL);
        self.disconnects.abort();

        // Stop the sweeper before the final sweep so the two cannot race.
        let _ = self.shutdown.send(true);
        let sweeper = self.sweeper.lock().unwrap().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        self.inner.gc();

        if let Some(metrics) = &self.inner.metrics {
            metrics.relay_status(false);
        }
        info!("relay service closed");
    }
}

/// Configures and starts a [`Relay`].
pub struct RelayBuilder {
    host: Arc<dyn RelayHost>,
    resources: Resources,
    acl: Option<Arc<dyn AclFilter>>,
    metrics: Option<Arc<dyn MetricsTracer>>,
    asn_resolver: Option<Arc<dyn AsnResolver>>,
}

impl RelayBuilder {
    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn acl(mut self, acl: Arc<dyn AclFilter>) -> Self {
        self.acl = Some(acl);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsTracer>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn asn_resolver(mut self, resolver: Arc<dyn AsnResolver>) -> Self {
        self.asn_resolver = Some(resolver);
        self
    }

    /// Build and start the service.
    ///
    /// Must be called inside a tokio runtime: the accept loop, disconnect
    /// hook and sweeper are spawned here.
    pub fn build(self) -> Result<Relay> {
        let service_span: Arc<dyn ResourceSpan> =
            Arc::from(self.host.resource_manager().service_span(SERVICE_NAME)?);

        let constraints = ConstraintTable::new(&self.resources, self.asn_resolver);
        let pool = Arc::new(BufferPool::new(self.resources.buffer_size));

        let inner = Arc::new(RelayInner {
            host: self.host,
            resources: self.resources,
            acl: self.acl,
            metrics: self.metrics,
            service_span,
            pool,
            state: Mutex::new(State {
                reservations: ReservationTable::new(),
                circuits: CircuitCounter::new(),
                constraints,
                closed: false,
            }),
        });

        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        inner.host.set_protocol_handler(HOP_PROTOCOL, inbound_tx);
        tokio::spawn(accept_loop(inner.clone(), inbound_rx));

        let disconnect_rx = inner.host.subscribe_disconnects();
        let disconnects = tokio::spawn(disconnect_loop(inner.clone(), disconnect_rx));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let sweeper = tokio::spawn(sweep_loop(inner.clone(), shutdown_rx));

        if let Some(metrics) = &inner.metrics {
            metrics.relay_status(true);
        }
        info!("relay service online as {}", inner.host.local_peer_id());

        Ok(Relay {
            inner,
            disconnects,
            sweeper: Mutex::new(Some(sweeper)),
            shutdown,
        })
    }
}

/// One task per inbound stream, so a slow handshake never blocks accept.
async fn accept_loop(inner: Arc<RelayInner>, mut inbound: mpsc::Receiver<InboundStream>) {
    while let Some(stream) = inbound.recv().await {
        tokio::spawn(handler::handle_stream(inner.clone(), stream));
    }
}

async fn disconnect_loop(inner: Arc<RelayInner>, mut disconnects: mpsc::Receiver<PeerId>) {
    while let Some(peer) = disconnects.recv().await {
        inner.disconnected(peer);
    }
}

async fn sweep_loop(inner: Arc<RelayInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // An interval's first tick completes immediately; skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => inner.gc(),
            _ = shutdown.changed() => return,
        }
    }
}
