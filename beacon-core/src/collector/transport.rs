//! Transport contract between the delivery driver and the network
//!
//! Every operation blocks the calling thread and reports an [`Outcome`]
//! instead of an error: the driver treats every failure the same way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::queue::MessageQueue;

/// Interval at which in-flight operations check for cancellation
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of a transport operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The endpoint accepted the request
    Success,
    /// Connection error, timeout, or non-success status
    Failure,
    /// Aborted by [`Transport::cancel`] before completion
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Blocking, cancellable network operations.
///
/// Implementations must return from an in-flight `send` or
/// `check_server_health` within roughly [`CANCEL_POLL_INTERVAL`] after
/// [`cancel`](Transport::cancel) is called.
pub trait Transport: Send + Sync {
    /// Serializes `batch` and posts it, giving up after `timeout`.
    fn send(&self, batch: &mut MessageQueue, timeout: Duration) -> Outcome;

    /// Probes the endpoint without a payload.
    fn check_server_health(&self, timeout: Duration) -> Outcome;

    /// Aborts the operation in flight, if any.
    fn cancel(&self);
}

/// Transport used when no endpoint is configured; every operation fails.
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn send(&self, batch: &mut MessageQueue, _timeout: Duration) -> Outcome {
        tracing::debug!(messages = batch.len(), "No collector configured; send failed");
        Outcome::Failure
    }

    fn check_server_health(&self, _timeout: Duration) -> Outcome {
        Outcome::Failure
    }

    fn cancel(&self) {}
}

/// Cooperative cancellation flag shared by a transport and its callers.
///
/// Each operation calls [`reset`](CancelSignal::reset) when it starts, so a
/// cancel issued while nothing is in flight has no lasting effect.
#[derive(Debug, Default)]
pub struct CancelSignal {
    requested: AtomicBool,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once the signal is raised.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
        }
    }

    /// Blocks for up to `timeout`. Returns true if cancelled in the meantime.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(CANCEL_POLL_INTERVAL.min(deadline - now));
        }
    }
}
