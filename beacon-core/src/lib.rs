//! # beacon-core
//!
//! Core library for beacon - an analytics event delivery agent.
//!
//! This library provides:
//! - Identifier and event types
//! - An ordered, durably persisted message queue
//! - A cancellable HTTP transport for the collection endpoint
//! - The delivery driver and its background worker
//! - Database storage layer with SQLite
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! Tracking calls append messages to the pending queue; one worker thread
//! detaches them into batches and sends them. A failed batch goes back to the
//! front of the queue and the worker probes the endpoint until it answers.
//!
//! ## Example
//!
//! ```rust,no_run
//! use beacon_core::{Agent, Config};
//!
//! let config = Config::load().expect("failed to load config");
//! let agent = Agent::open(&config).expect("failed to open agent");
//! agent.start().expect("failed to start delivery");
//!
//! agent.track_milestone("level", "3");
//! agent.track_revenue(4.99, "USD", None);
//!
//! agent.stop().expect("failed to stop delivery");
//! ```

// Re-export commonly used items at the crate root
pub use agent::Agent;
pub use collector::{CollectorClient, Outcome, Transport};
pub use config::Config;
pub use db::{Database, KeyValueStore};
pub use delivery::{DeliveryContext, DeliveryDriver, DeliveryStats, DeliveryWorker, DriverState};
pub use error::{Error, Result};
pub use queue::{Message, MessageQueue};
pub use types::*;

// Public modules
pub mod agent;
pub mod collector;
pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod queue;
pub mod types;
