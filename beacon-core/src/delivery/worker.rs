//! Background thread running the delivery driver

use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::collector::{Transport, CANCEL_POLL_INTERVAL};
use crate::error::Result;

use super::context::{DeliveryContext, DeliveryStats};
use super::driver::{DeliveryDriver, DriverState};

/// Name of the delivery thread
pub const WORKER_THREAD_NAME: &str = "beacon-delivery";

/// A background thread stepping a [`DeliveryDriver`] until stopped.
///
/// ## Example
///
/// ```ignore
/// let worker = DeliveryWorker::spawn(Arc::clone(&context), transport)?;
///
/// // ... track events ...
///
/// let state = worker.stop();
/// assert_eq!(state, DriverState::Idle);
/// ```
pub struct DeliveryWorker {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<DriverState>>,
    context: Arc<DeliveryContext>,
    transport: Arc<dyn Transport>,
}

impl DeliveryWorker {
    /// Spawn the delivery thread.
    pub fn spawn(context: Arc<DeliveryContext>, transport: Arc<dyn Transport>) -> Result<Self> {
        let (stop_tx, stop_rx) = channel();
        context.set_stopping(false);

        let mut driver = DeliveryDriver::new(Arc::clone(&context), Arc::clone(&transport));
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                tracing::debug!("Delivery worker started");
                loop {
                    let wait = driver.step();
                    match stop_rx.recv_timeout(wait) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                }
                driver.halt();
                tracing::debug!("Delivery worker stopped");
                driver.state()
            })?;

        Ok(Self {
            stop_tx,
            handle: Some(handle),
            context,
            transport,
        })
    }

    /// Signal the worker to stop, abort the operation in flight, and wait
    /// for the thread to finish. Returns the final driver state.
    pub fn stop(mut self) -> DriverState {
        self.signal_stop();

        let Some(handle) = self.handle.take() else {
            return DriverState::Idle;
        };

        // A cancel can land just before the transport starts its operation;
        // repeat it until the thread exits.
        while !handle.is_finished() {
            self.transport.cancel();
            thread::sleep(CANCEL_POLL_INTERVAL);
        }

        let state = handle.join().unwrap_or_else(|_| {
            tracing::warn!("Delivery worker panicked");
            DriverState::Idle
        });
        self.context.set_stopping(false);
        state
    }

    /// Signal the worker to stop without waiting.
    pub fn signal_stop(&self) {
        self.context.set_stopping(true);
        let _ = self.stop_tx.send(());
        self.transport.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stats(&self) -> DeliveryStats {
        self.context.stats()
    }
}

impl Drop for DeliveryWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.signal_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CancelSignal, Outcome};
    use crate::config::DeliveryConfig;
    use crate::db::Database;
    use crate::queue::{Message, MessageQueue};
    use crate::types::{Event, Identifiers};
    use std::time::{Duration, Instant};

    /// Transport whose sends block until cancelled
    #[derive(Default)]
    struct HangingTransport {
        signal: CancelSignal,
    }

    impl Transport for HangingTransport {
        fn send(&self, _batch: &mut MessageQueue, _timeout: Duration) -> Outcome {
            self.signal.reset();
            if self.signal.wait(Duration::from_secs(60)) {
                Outcome::Cancelled
            } else {
                Outcome::Failure
            }
        }

        fn check_server_health(&self, _timeout: Duration) -> Outcome {
            Outcome::Success
        }

        fn cancel(&self) {
            self.signal.cancel();
        }
    }

    fn context() -> Arc<DeliveryContext> {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let config = DeliveryConfig {
            update_interval_ms: 10,
            ..Default::default()
        };
        Arc::new(DeliveryContext::new(Arc::new(db), &config))
    }

    #[test]
    fn test_stop_interrupts_hanging_send() {
        let context = context();
        context.enqueue(Message::new(
            &Identifiers::new(),
            Event::milestone("boss", "1").unwrap(),
        ));

        let worker =
            DeliveryWorker::spawn(Arc::clone(&context), Arc::new(HangingTransport::default()))
                .unwrap();
        let start = Instant::now();
        while !context.is_sending() {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(5));
        }

        let stopped_at = Instant::now();
        assert_eq!(worker.stop(), DriverState::Idle);
        assert!(stopped_at.elapsed() < Duration::from_millis(500));

        assert!(!context.is_sending());
        assert_eq!(context.pending_count(), 1);
    }

    #[test]
    fn test_worker_delivers_in_background() {
        let context = context();
        context.set_test_mode(crate::types::TestMode::SimulateServer);
        let worker = DeliveryWorker::spawn(
            Arc::clone(&context),
            Arc::new(HangingTransport::default()),
        )
        .unwrap();
        assert!(worker.is_running());

        for step in ["a", "b", "c"] {
            context.enqueue(Message::new(
                &Identifiers::new(),
                Event::tutorial(step).unwrap(),
            ));
        }

        let start = Instant::now();
        while context.pending_count() > 0 {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(5));
        }

        worker.stop();
        assert_eq!(context.stats().messages_delivered, 3);
    }
}
