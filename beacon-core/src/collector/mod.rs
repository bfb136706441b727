//! Collection endpoint client
//!
//! Events are always written to the local queue first; the delivery worker
//! forwards them through a [`Transport`]. Network failures never block
//! tracking calls.
//!
//! ## Usage
//!
//! Configure the endpoint in `~/.config/beacon/config.toml`:
//!
//! ```toml
//! [collector]
//! server_url = "https://collect.example.com"
//! api_key = "app-key"
//! secret_key = "app-secret"
//! ```

mod client;
mod transport;

pub use client::{CollectorClient, SDK_TYPE, SDK_VERSION};
pub use transport::{CancelSignal, NullTransport, Outcome, Transport, CANCEL_POLL_INTERVAL};
