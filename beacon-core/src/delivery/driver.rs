//! Availability state machine driving the pending queue through a transport

use std::sync::Arc;
use std::time::Duration;

use crate::collector::{Outcome, Transport};
use crate::queue::MessageQueue;
use crate::types::TestMode;

use super::context::DeliveryContext;

/// Driver state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Waiting for pending messages
    Idle,
    /// A send is due on the next step
    Sending,
    /// The endpoint is unreachable; probing until it answers
    ProbingAvailability,
}

impl DriverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverState::Idle => "idle",
            DriverState::Sending => "sending",
            DriverState::ProbingAvailability => "probing_availability",
        }
    }
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery driver.
///
/// Each [`step`](DeliveryDriver::step) performs at most one transport
/// operation and returns how long to wait before the next step:
///
/// | state | step | next |
/// |---|---|---|
/// | `Idle` | send if anything is pending | `update_interval` |
/// | `Sending` | send now | `update_interval` |
/// | `ProbingAvailability` | probe | `check_server_interval`, or zero after a successful probe |
///
/// A failed send moves to `ProbingAvailability`; a cancelled operation moves
/// to `Idle`.
pub struct DeliveryDriver {
    context: Arc<DeliveryContext>,
    transport: Arc<dyn Transport>,
    state: DriverState,
}

impl DeliveryDriver {
    pub fn new(context: Arc<DeliveryContext>, transport: Arc<dyn Transport>) -> Self {
        Self {
            context,
            transport,
            state: DriverState::Idle,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Runs one step of the state machine.
    pub fn step(&mut self) -> Duration {
        if self.context.is_stopping() {
            self.halt();
            return self.context.update_interval();
        }

        if let Err(e) = self.context.persist() {
            tracing::warn!(error = %e, "Failed to persist pending queue");
        }

        match self.state {
            DriverState::Idle | DriverState::Sending => self.send_pending(),
            DriverState::ProbingAvailability => self.probe(),
        }
    }

    /// Forces the driver back to `Idle`.
    pub fn halt(&mut self) {
        if self.state != DriverState::Idle {
            self.transition(DriverState::Idle);
        }
    }

    fn send_pending(&mut self) -> Duration {
        let Some(mut batch) = self.context.detach_batch() else {
            if self.state == DriverState::Sending {
                self.transition(DriverState::Idle);
            }
            return self.context.update_interval();
        };

        if self.state == DriverState::Idle {
            self.transition(DriverState::Sending);
        }

        let messages = batch.len();
        tracing::debug!(messages, "Sending batch");
        let outcome = self.send(&mut batch);
        self.context.complete_batch(batch, outcome);

        match outcome {
            Outcome::Success => {
                tracing::debug!(messages, "Batch delivered");
                self.context.set_server_available(true);
                self.transition(DriverState::Idle);
                self.context.update_interval()
            }
            Outcome::Failure => {
                tracing::warn!(messages, "Batch send failed; returned to queue");
                self.context.set_server_available(false);
                self.transition(DriverState::ProbingAvailability);
                self.context.check_server_interval()
            }
            Outcome::Cancelled => {
                tracing::debug!(messages, "Batch send cancelled; returned to queue");
                self.transition(DriverState::Idle);
                self.context.update_interval()
            }
        }
    }

    fn probe(&mut self) -> Duration {
        self.context.record_probe();

        match self.check_server_health() {
            Outcome::Success => {
                self.context.set_server_available(true);
                self.transition(DriverState::Sending);
                Duration::ZERO
            }
            Outcome::Failure => {
                tracing::debug!("Server still unavailable");
                self.context.check_server_interval()
            }
            Outcome::Cancelled => {
                self.transition(DriverState::Idle);
                self.context.update_interval()
            }
        }
    }

    fn send(&self, batch: &mut MessageQueue) -> Outcome {
        match self.context.test_mode() {
            TestMode::None => self.transport.send(batch, self.context.send_timeout()),
            TestMode::SimulateServer => Outcome::Success,
            TestMode::SimulateOffline => Outcome::Failure,
        }
    }

    fn check_server_health(&self) -> Outcome {
        match self.context.test_mode() {
            TestMode::None => self
                .transport
                .check_server_health(self.context.send_timeout()),
            TestMode::SimulateServer => Outcome::Success,
            TestMode::SimulateOffline => Outcome::Failure,
        }
    }

    fn transition(&mut self, next: DriverState) {
        tracing::info!(from = %self.state, to = %next, "Delivery state changed");
        self.state = next;
    }
}
