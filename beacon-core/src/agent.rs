//! Tracking API
//!
//! An [`Agent`] owns the identifier store, the delivery context and the
//! delivery worker. Tracking calls validate their arguments, snapshot the
//! current identifiers into a [`Message`] and append it to the pending
//! queue. Calls made before [`Agent::initialize`] or while analytics is
//! disabled do nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use uuid::Uuid;

use crate::collector::{CollectorClient, NullTransport, Transport};
use crate::config::Config;
use crate::db::{Database, KeyValueStore};
use crate::delivery::{DeliveryContext, DeliveryStats, DeliveryWorker};
use crate::error::Result;
use crate::queue::Message;
use crate::types::{Event, IdKind, Identifiers, TestMode};

/// Storage key of the identifier store
pub const IDENTIFIERS_KEY: &str = "identifiers";

/// Event tracking context
pub struct Agent {
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn Transport>,
    context: Arc<DeliveryContext>,
    identifiers: Mutex<Identifiers>,
    initialized: AtomicBool,
    analytics_enabled: AtomicBool,
    payable: AtomicBool,
    worker: Mutex<Option<DeliveryWorker>>,
}

impl Agent {
    pub fn new(
        config: &Config,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let context = Arc::new(DeliveryContext::new(Arc::clone(&store), &config.delivery));
        Self {
            store,
            transport,
            context,
            identifiers: Mutex::new(Identifiers::new()),
            initialized: AtomicBool::new(false),
            analytics_enabled: AtomicBool::new(config.analytics.enabled),
            payable: AtomicBool::new(config.analytics.payable),
            worker: Mutex::new(None),
        }
    }

    /// Opens the database at the default path and connects the configured
    /// collector. Without collector credentials every send fails and the
    /// queue is kept until a configured run delivers it.
    pub fn open(config: &Config) -> Result<Self> {
        let db = Database::open(&Config::database_path())?;
        db.migrate()?;

        let transport: Arc<dyn Transport> = if config.collector.is_ready() {
            Arc::new(CollectorClient::new(&config.collector)?)
        } else {
            tracing::info!("No collector configured");
            Arc::new(NullTransport)
        };

        Ok(Self::new(config, Arc::new(db), transport))
    }

    fn ids(&self) -> MutexGuard<'_, Identifiers> {
        self.identifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads the pending queue and identifiers, and assigns an install ID
    /// on first run. Repeated calls do nothing.
    pub fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut ids = self.ids();
        *ids = load_identifiers(self.store.as_ref());
        if ids.get(IdKind::Install).is_empty() {
            let install_id = Uuid::new_v4().to_string();
            tracing::info!(install_id = %install_id, "Assigned install ID");
            ids.set(IdKind::Install, install_id);
            save_identifiers(self.store.as_ref(), &ids)?;
        }
        drop(ids);

        let pending = self.context.load();
        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(pending, "Agent initialized");
        Ok(())
    }

    /// Initializes and starts background delivery.
    pub fn start(&self) -> Result<()> {
        self.initialize()?;

        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_none() {
            *worker = Some(DeliveryWorker::spawn(
                Arc::clone(&self.context),
                Arc::clone(&self.transport),
            )?);
            tracing::info!("Delivery started");
        }
        Ok(())
    }

    /// Like [`start`](Agent::start), also setting the custom ID.
    pub fn start_with_custom_id(&self, custom_id: &str) -> Result<()> {
        self.start()?;
        self.set_id(IdKind::Custom, custom_id)
    }

    /// Like [`start`](Agent::start), also setting the payable flag and,
    /// if given, the custom ID.
    pub fn start_payable(&self, payable: bool, custom_id: Option<&str>) -> Result<()> {
        self.set_payable(payable);
        match custom_id {
            Some(id) => self.start_with_custom_id(id),
            None => self.start(),
        }
    }

    /// Stops background delivery, aborting any send in flight, and saves
    /// the pending queue.
    pub fn stop(&self) -> Result<()> {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let state = worker.stop();
            tracing::info!(%state, pending = self.context.pending_count(), "Delivery stopped");
        }
        self.persist().map(|_| ())
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(DeliveryWorker::is_running)
    }

    // ============================================
    // Tracking calls
    // ============================================

    fn track(&self, event: Option<Event>, call: &'static str) {
        if !self.is_initialized() || !self.analytics_enabled() {
            tracing::debug!(call, "Tracking call ignored");
            return;
        }
        let Some(event) = event else {
            tracing::debug!(call, "Invalid tracking arguments ignored");
            return;
        };

        // Held across enqueue so identifier updates cannot slip in between
        let ids = self.ids();
        self.context.enqueue(Message::new(&ids, event));
    }

    pub fn track_revenue(&self, amount: f64, currency: &str, reward: Option<&str>) {
        self.track(
            Event::revenue(amount, currency, None, reward),
            "track_revenue",
        );
    }

    pub fn track_revenue_with_virtual_currency(
        &self,
        amount: f64,
        currency: &str,
        virtual_amount: f64,
        reward: Option<&str>,
    ) {
        self.track(
            Event::revenue(amount, currency, Some(virtual_amount), reward),
            "track_revenue_with_virtual_currency",
        );
    }

    pub fn track_item_purchase(&self, name: &str) {
        self.track(Event::item_purchase(name, None), "track_item_purchase");
    }

    pub fn track_item_purchase_with_virtual_currency(&self, name: &str, virtual_amount: f64) {
        self.track(
            Event::item_purchase(name, Some(virtual_amount)),
            "track_item_purchase_with_virtual_currency",
        );
    }

    pub fn track_tutorial(&self, step: &str) {
        self.track(Event::tutorial(step), "track_tutorial");
    }

    pub fn track_milestone(&self, name: &str, value: &str) {
        self.track(Event::milestone(name, value), "track_milestone");
    }

    pub fn track_marketing(
        &self,
        partner: Option<&str>,
        campaign: Option<&str>,
        ad: Option<&str>,
        sub_id: Option<&str>,
        sub_sub_id: Option<&str>,
    ) {
        self.track(
            Event::marketing(partner, campaign, ad, sub_id, sub_sub_id),
            "track_marketing",
        );
    }

    pub fn track_user_attribute(&self, name: &str, value: &str) {
        self.track(Event::user_attribute(name, value), "track_user_attribute");
    }

    pub fn track_country(&self, country: &str) {
        self.track(Event::country(country), "track_country");
    }

    // ============================================
    // Identifiers
    // ============================================

    /// Stores an identifier and patches every queued message.
    ///
    /// An empty value clears the identifier.
    pub fn set_id(&self, kind: IdKind, value: &str) -> Result<()> {
        let mut ids = self.ids();
        ids.set(kind, value);
        save_identifiers(self.store.as_ref(), &ids)?;

        let patched = self.context.update_identifier(kind, value);
        tracing::debug!(kind = %kind, patched, "Identifier updated");
        Ok(())
    }

    pub fn clear_id(&self, kind: IdKind) -> Result<()> {
        self.set_id(kind, "")
    }

    /// Current value of an identifier, `""` if unknown
    pub fn id(&self, kind: IdKind) -> String {
        self.ids().get(kind).to_string()
    }

    pub fn identifiers(&self) -> Identifiers {
        self.ids().clone()
    }

    // ============================================
    // Properties
    // ============================================

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn analytics_enabled(&self) -> bool {
        self.analytics_enabled.load(Ordering::SeqCst)
    }

    pub fn set_analytics_enabled(&self, enabled: bool) {
        self.analytics_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether payable events are active; defaults to true
    pub fn payable(&self) -> bool {
        self.payable.load(Ordering::SeqCst)
    }

    pub fn set_payable(&self, payable: bool) {
        self.payable.store(payable, Ordering::SeqCst);
    }

    pub fn server_available(&self) -> bool {
        self.context.server_available()
    }

    /// Messages tracked but not yet confirmed delivered
    pub fn pending_count(&self) -> usize {
        self.context.pending_count()
    }

    pub fn update_interval(&self) -> Duration {
        self.context.update_interval()
    }

    pub fn set_update_interval(&self, interval: Duration) {
        self.context.set_update_interval(interval);
    }

    pub fn send_timeout(&self) -> Duration {
        self.context.send_timeout()
    }

    pub fn set_send_timeout(&self, timeout: Duration) {
        self.context.set_send_timeout(timeout);
    }

    pub fn check_server_interval(&self) -> Duration {
        self.context.check_server_interval()
    }

    pub fn set_check_server_interval(&self, interval: Duration) {
        self.context.set_check_server_interval(interval);
    }

    pub fn test_mode(&self) -> TestMode {
        self.context.test_mode()
    }

    pub fn set_test_mode(&self, mode: TestMode) {
        self.context.set_test_mode(mode);
    }

    pub fn stats(&self) -> DeliveryStats {
        self.context.stats()
    }

    /// Delivery state shared with the worker
    pub fn context(&self) -> &Arc<DeliveryContext> {
        &self.context
    }

    /// Saves the pending queue if it changed. Returns true if written.
    pub fn persist(&self) -> Result<bool> {
        self.context.persist()
    }

    /// Drops every pending message, including the durable copy.
    pub fn clear_pending(&self) -> Result<()> {
        self.context.clear()
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "Failed to stop agent cleanly");
        }
    }
}

fn load_identifiers(store: &dyn KeyValueStore) -> Identifiers {
    match store.get_string(IDENTIFIERS_KEY) {
        Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Discarding unreadable identifiers");
            Identifiers::new()
        }),
        Ok(None) => Identifiers::new(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read identifiers");
            Identifiers::new()
        }
    }
}

fn save_identifiers(store: &dyn KeyValueStore, ids: &Identifiers) -> Result<()> {
    store.set_string(IDENTIFIERS_KEY, &serde_json::to_string(ids)?)
}
