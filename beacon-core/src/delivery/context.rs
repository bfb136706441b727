//! Shared state between producers and the delivery driver

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::collector::Outcome;
use crate::config::{DeliveryConfig, MIN_INTERVAL_MS};
use crate::db::KeyValueStore;
use crate::error::Result;
use crate::queue::{Message, MessageQueue};
use crate::types::{IdKind, TestMode};

/// Pending queue plus bookkeeping for the batch in flight
#[derive(Debug, Default)]
struct Pending {
    queue: MessageQueue,
    /// Messages detached into the outgoing batch
    in_flight: usize,
    /// Serialized outgoing batch, saved ahead of the pending messages
    in_flight_json: Option<String>,
    /// Identifier updates made while a batch was in flight, oldest first
    deferred_ids: Vec<(IdKind, String)>,
}

/// Delivery statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryStats {
    pub batches_sent: usize,
    pub batches_failed: usize,
    pub messages_delivered: usize,
    pub probes: usize,
}

#[derive(Debug, Default)]
struct StatsCounters {
    batches_sent: AtomicUsize,
    batches_failed: AtomicUsize,
    messages_delivered: AtomicUsize,
    probes: AtomicUsize,
}

/// State shared by tracking calls and the delivery worker.
///
/// Every pending queue mutation happens under one short lock. Network and
/// storage IO never run while it is held. Storage writes are serialized by a
/// second lock so an older record never overwrites a newer one.
pub struct DeliveryContext {
    pending: Mutex<Pending>,
    writer: Mutex<()>,
    store: Arc<dyn KeyValueStore>,
    update_interval_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
    check_server_interval_ms: AtomicU64,
    test_mode: AtomicU8,
    server_available: AtomicBool,
    stopping: AtomicBool,
    stats: StatsCounters,
}

impl DeliveryContext {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &DeliveryConfig) -> Self {
        let context = Self {
            pending: Mutex::new(Pending::default()),
            writer: Mutex::new(()),
            store,
            update_interval_ms: AtomicU64::new(0),
            send_timeout_ms: AtomicU64::new(0),
            check_server_interval_ms: AtomicU64::new(0),
            test_mode: AtomicU8::new(config.test_mode.as_u8()),
            server_available: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            stats: StatsCounters::default(),
        };
        context.set_update_interval(config.update_interval());
        context.set_send_timeout(config.send_timeout());
        context.set_check_server_interval(config.check_server_interval());
        context
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        // queue operations cannot panic halfway through a splice
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &dyn KeyValueStore {
        self.store.as_ref()
    }

    /// Replaces the pending queue with its durable copy.
    pub fn load(&self) -> usize {
        let mut loaded = MessageQueue::new();
        let count = loaded.load(self.store.as_ref());

        let mut pending = self.lock();
        pending.queue.destroy();
        pending.queue.prepend(&mut loaded, true);
        pending.queue.mark_saved();
        count
    }

    /// Appends a message at the tail of the pending queue.
    pub fn enqueue(&self, message: Message) {
        let mut pending = self.lock();
        pending.queue.add(message);
        tracing::trace!(pending = pending.queue.len(), "Message queued");
    }

    /// Propagates an identifier update into every resident message.
    ///
    /// While a batch is in flight the update is also recorded, so it can be
    /// replayed onto the batch if the batch comes back.
    pub fn update_identifier(&self, kind: IdKind, value: &str) -> usize {
        let mut pending = self.lock();
        if pending.in_flight > 0 {
            pending.deferred_ids.push((kind, value.to_string()));
        }
        pending.queue.update_identifier(kind, value)
    }

    /// Moves every pending message into a new outgoing batch.
    ///
    /// Returns `None` if nothing is pending or a batch is already in flight.
    /// Until the batch is settled, saves keep it in the stored record ahead
    /// of newer messages.
    pub fn detach_batch(&self) -> Option<MessageQueue> {
        let mut pending = self.lock();
        if pending.in_flight > 0 || pending.queue.is_empty() {
            return None;
        }

        let was_dirty = pending.queue.is_dirty();
        let mut batch = pending.queue.take_all();
        match batch.to_json() {
            Ok(json) => {
                pending.in_flight = batch.len();
                pending.in_flight_json = Some(json);
                // the stored record already holds exactly the batch
                if !was_dirty {
                    pending.queue.mark_saved();
                }
                Some(batch)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize outgoing batch");
                pending.queue.prepend(&mut batch, true);
                None
            }
        }
    }

    /// Settles the batch in flight.
    ///
    /// On success the batch is released. Otherwise it goes back to the front
    /// of the pending queue with any identifier updates made in the meantime.
    /// The pending queue is persisted in both cases.
    pub fn complete_batch(&self, mut batch: MessageQueue, outcome: Outcome) {
        {
            let mut pending = self.lock();
            let deferred = std::mem::take(&mut pending.deferred_ids);
            pending.in_flight = 0;
            pending.in_flight_json = None;

            if outcome.is_success() {
                self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .messages_delivered
                    .fetch_add(batch.len(), Ordering::Relaxed);
                batch.destroy();
                // the stored record still holds the delivered batch
                pending.queue.mark_dirty();
            } else {
                if outcome == Outcome::Failure {
                    self.stats.batches_failed.fetch_add(1, Ordering::Relaxed);
                }
                for (kind, value) in &deferred {
                    batch.update_identifier(*kind, value);
                }
                pending.queue.prepend(&mut batch, true);
            }
        }

        if let Err(e) = self.persist() {
            tracing::warn!(
                error = %e,
                pending = self.pending_count(),
                "Failed to persist pending queue"
            );
        }
    }

    /// Saves the pending queue if it changed since the last save.
    ///
    /// A batch in flight is stored ahead of the pending messages. The record
    /// is built under the queue lock and written after releasing it; a failed
    /// write leaves the queue dirty so the next save retries.
    pub fn persist(&self) -> Result<bool> {
        let _writer = self.writer();
        let (key, record, messages) = {
            let mut guard = self.lock();
            let pending = &mut *guard;
            if !pending.queue.is_dirty() {
                return Ok(false);
            }
            let record = pending
                .queue
                .encode_record(pending.in_flight_json.as_deref())?;
            pending.queue.mark_saved();
            (
                pending.queue.storage_key().to_string(),
                record,
                pending.queue.len() + pending.in_flight,
            )
        };

        if let Err(e) = self.store.set_string(&key, &record) {
            self.lock().queue.mark_dirty();
            return Err(e);
        }
        tracing::debug!(key = %key, messages, bytes = record.len(), "Saved message queue");
        Ok(true)
    }

    /// Drops every pending message and erases the durable copy.
    ///
    /// A batch in flight is not pending; it stays stored until settled.
    pub fn clear(&self) -> Result<()> {
        let _writer = self.writer();
        let (key, record) = {
            let mut guard = self.lock();
            let pending = &mut *guard;
            pending.queue.destroy();
            let record = match pending.in_flight_json.as_deref() {
                Some(batch) => Some(pending.queue.encode_record(Some(batch))?),
                None => None,
            };
            pending.queue.mark_saved();
            (pending.queue.storage_key().to_string(), record)
        };

        let written = match &record {
            Some(record) => self.store.set_string(&key, record),
            None => self.store.remove(&key),
        };
        if written.is_err() {
            self.lock().queue.mark_dirty();
        }
        written
    }

    /// Messages not yet confirmed delivered, including the batch in flight.
    pub fn pending_count(&self) -> usize {
        let pending = self.lock();
        pending.queue.len() + pending.in_flight
    }

    pub fn is_sending(&self) -> bool {
        self.lock().in_flight > 0
    }

    /// Serialized pending queue, in send order
    pub fn pending_json(&self) -> Result<String> {
        self.lock().queue.to_json()
    }

    pub fn has_pending_event_type(&self, event_type: &str) -> bool {
        self.lock().queue.has_event_type(event_type)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_update_interval(&self, interval: Duration) {
        self.update_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.load(Ordering::Relaxed))
    }

    /// Values below [`MIN_INTERVAL_MS`] are raised to it.
    pub fn set_send_timeout(&self, timeout: Duration) {
        self.send_timeout_ms.store(clamp_ms(timeout), Ordering::Relaxed);
    }

    pub fn check_server_interval(&self) -> Duration {
        Duration::from_millis(self.check_server_interval_ms.load(Ordering::Relaxed))
    }

    /// Values below [`MIN_INTERVAL_MS`] are raised to it.
    pub fn set_check_server_interval(&self, interval: Duration) {
        self.check_server_interval_ms
            .store(clamp_ms(interval), Ordering::Relaxed);
    }

    pub fn test_mode(&self) -> TestMode {
        TestMode::from_u8(self.test_mode.load(Ordering::Relaxed))
    }

    pub fn set_test_mode(&self, mode: TestMode) {
        self.test_mode.store(mode.as_u8(), Ordering::Relaxed);
    }

    /// True if the last transport interaction succeeded
    pub fn server_available(&self) -> bool {
        self.server_available.load(Ordering::SeqCst)
    }

    pub(crate) fn set_server_available(&self, available: bool) {
        let was = self.server_available.swap(available, Ordering::SeqCst);
        if was != available {
            tracing::info!(available, "Server availability changed");
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn set_stopping(&self, stopping: bool) {
        self.stopping.store(stopping, Ordering::SeqCst);
    }

    pub(crate) fn record_probe(&self) {
        self.stats.probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            batches_sent: self.stats.batches_sent.load(Ordering::Relaxed),
            batches_failed: self.stats.batches_failed.load(Ordering::Relaxed),
            messages_delivered: self.stats.messages_delivered.load(Ordering::Relaxed),
            probes: self.stats.probes.load(Ordering::Relaxed),
        }
    }
}

fn clamp_ms(duration: Duration) -> u64 {
    (duration.as_millis() as u64).max(MIN_INTERVAL_MS)
}
