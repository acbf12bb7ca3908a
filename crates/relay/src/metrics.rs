//! Metrics hooks.
//!
//! The relay reports events through this trait; wiring them to a metrics
//! backend is the embedder's concern. Every method has an empty default so
//! implementations only override what they record.

use std::time::Duration;

use splicenet_proto::Status;

/// Observer for relay service events.
pub trait MetricsTracer: Send + Sync {
    /// The relay service came up (`true`) or shut down (`false`).
    fn relay_status(&self, online: bool) {
        let _ = online;
    }

    /// A RESERVE request finished with `status`.
    fn reservation_request_handled(&self, status: Status) {
        let _ = status;
    }

    /// A CONNECT request finished with `status`.
    fn connection_request_handled(&self, status: Status) {
        let _ = status;
    }

    /// A reservation was granted; `renewed` when the peer already held one.
    fn reservation_allowed(&self, renewed: bool) {
        let _ = renewed;
    }

    /// `count` reservations were released by a sweep or disconnect.
    fn reservations_closed(&self, count: usize) {
        let _ = count;
    }

    /// A circuit was admitted.
    fn connection_opened(&self) {}

    /// A circuit was torn down after `elapsed`.
    fn connection_closed(&self, elapsed: Duration) {
        let _ = elapsed;
    }

    /// `n` bytes moved through a pump.
    fn bytes_transferred(&self, n: usize) {
        let _ = n;
    }
}
