//! Delivery engine
//!
//! Tracking calls append to the pending queue held by a [`DeliveryContext`].
//! A single [`DeliveryWorker`] thread steps the [`DeliveryDriver`], which
//! detaches the pending messages into a batch, hands it to the transport and
//! settles the outcome:
//!
//! - success releases the batch
//! - failure returns the batch to the front of the queue and switches to
//!   probing the endpoint every `check_server_interval`
//! - cancellation returns the batch and goes back to idle
//!
//! Delivery is at least once: a crash after the endpoint accepted a batch but
//! before the queue was saved resends that batch on the next launch.

mod context;
mod driver;
mod worker;

pub use context::{DeliveryContext, DeliveryStats};
pub use driver::{DeliveryDriver, DriverState};
pub use worker::{DeliveryWorker, WORKER_THREAD_NAME};
