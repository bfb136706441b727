//! HTTP client for the collection endpoint
//!
//! Implements [`Transport`] on top of `reqwest`. Requests run on a private
//! current-thread runtime so callers see a blocking interface.

use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use sha2::{Digest, Sha256};

use crate::config::CollectorConfig;
use crate::error::{Error, Result};
use crate::queue::MessageQueue;

use super::transport::{CancelSignal, Outcome, Transport};

/// Version reported in the `X-Sdk-Version` header
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Value of the `X-Sdk-Type` header
pub const SDK_TYPE: &str = "rust";

/// HTTP client for the collection endpoint
pub struct CollectorClient {
    http_client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
    cancel: CancelSignal,
    events_url: String,
    health_url: String,
    secret_key: String,
}

impl CollectorClient {
    /// Create a new collector client from configuration
    ///
    /// Returns an error if the configuration is invalid or missing required fields.
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .server_url
            .as_deref()
            .ok_or_else(|| Error::Config("collector.server_url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();
        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| Error::Config("collector.api_key is required".to_string()))?;
        let secret_key = config
            .secret_key
            .clone()
            .ok_or_else(|| Error::Config("collector.secret_key is required".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "X-Api-Key",
            HeaderValue::from_str(api_key)
                .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
        );
        headers.insert("X-Sdk-Version", HeaderValue::from_static(SDK_VERSION));
        headers.insert("X-Sdk-Type", HeaderValue::from_static(SDK_TYPE));

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Collector(format!("failed to create HTTP client: {}", e)))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Collector(format!("failed to create runtime: {}", e)))?;

        Ok(Self {
            http_client,
            runtime,
            cancel: CancelSignal::new(),
            events_url: format!("{}/v1/events", base_url),
            health_url: format!("{}/health", base_url),
            secret_key,
        })
    }

    /// Hex SHA-256 of the secret key followed by the body
    pub fn signature(&self, body: &str) -> String {
        sign(&self.secret_key, body)
    }

    /// Runs a request to completion unless cancelled or timed out.
    fn execute<F>(&self, operation: &'static str, timeout: Duration, request: F) -> Outcome
    where
        F: Future<Output = reqwest::Result<reqwest::Response>>,
    {
        self.cancel.reset();

        let outcome = self.runtime.block_on(async {
            tokio::select! {
                result = tokio::time::timeout(timeout, request) => match result {
                    Ok(Ok(response)) if response.status().is_success() => Outcome::Success,
                    Ok(Ok(response)) => {
                        tracing::warn!(operation, status = %response.status(), "Collector rejected request");
                        Outcome::Failure
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(operation, error = %e, "HTTP request failed");
                        Outcome::Failure
                    }
                    Err(_) => {
                        tracing::warn!(operation, timeout_ms = timeout.as_millis() as u64, "HTTP request timed out");
                        Outcome::Failure
                    }
                },
                _ = self.cancel.cancelled() => Outcome::Cancelled,
            }
        });

        tracing::debug!(operation, ?outcome, "Collector request finished");
        outcome
    }
}

impl Transport for CollectorClient {
    fn send(&self, batch: &mut MessageQueue, timeout: Duration) -> Outcome {
        let body = match batch.to_json() {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize batch");
                return Outcome::Failure;
            }
        };

        let request = self
            .http_client
            .post(&self.events_url)
            .header("X-Signature", self.signature(&body))
            .body(body)
            .send();
        self.execute("send", timeout, request)
    }

    fn check_server_health(&self, timeout: Duration) -> Outcome {
        let request = self.http_client.get(&self.health_url).send();
        self.execute("check_server_health", timeout, request)
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

fn sign(secret_key: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret_key.as_bytes());
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Message;
    use crate::types::{Event, Identifiers};
    use std::io::Read;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn config(url: &str) -> CollectorConfig {
        CollectorConfig {
            server_url: Some(url.to_string()),
            api_key: Some("key-1".to_string()),
            secret_key: Some("secret".to_string()),
        }
    }

    #[test]
    fn test_client_requires_valid_config() {
        assert!(CollectorClient::new(&CollectorConfig::default()).is_err());
        assert!(CollectorClient::new(&config("ftp://collect.example.com")).is_err());
    }

    #[test]
    fn test_client_with_valid_config() {
        let client = CollectorClient::new(&config("https://collect.example.com/")).unwrap();
        assert_eq!(client.events_url, "https://collect.example.com/v1/events");
        assert_eq!(client.health_url, "https://collect.example.com/health");
    }

    #[test]
    fn test_signature_is_hex_sha256_of_secret_and_body() {
        // sha256("secret" + "[]")
        let expected = {
            let mut hasher = Sha256::new();
            hasher.update(b"secret[]");
            hex::encode(hasher.finalize())
        };
        assert_eq!(sign("secret", "[]"), expected);
        assert_eq!(sign("secret", "[]").len(), 64);
        assert_ne!(sign("secret", "[]"), sign("other", "[]"));
    }

    #[test]
    fn test_unreachable_endpoint_is_failure() {
        // Bind then drop to get a port nothing listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = CollectorClient::new(&config(&format!("http://127.0.0.1:{}", port))).unwrap();

        assert_eq!(
            client.check_server_health(Duration::from_secs(2)),
            Outcome::Failure
        );
    }

    #[test]
    fn test_cancel_aborts_hanging_send() {
        // Accepts connections but never answers
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let mut held = Vec::new();
            for mut stream in listener.incoming().flatten() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                held.push(stream);
            }
        });

        let client =
            Arc::new(CollectorClient::new(&config(&format!("http://127.0.0.1:{}", port))).unwrap());
        let sender = {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                let mut batch = MessageQueue::new();
                batch.add(Message::new(
                    &Identifiers::new(),
                    Event::tutorial("intro").unwrap(),
                ));
                client.send(&mut batch, Duration::from_secs(30))
            })
        };

        thread::sleep(Duration::from_millis(100));
        let cancelled_at = Instant::now();
        client.cancel();
        assert_eq!(sender.join().unwrap(), Outcome::Cancelled);
        assert!(cancelled_at.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_timeout_is_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming().flatten() {
                held.push(stream);
            }
        });

        let client = CollectorClient::new(&config(&format!("http://127.0.0.1:{}", port))).unwrap();
        let start = Instant::now();
        assert_eq!(
            client.check_server_health(Duration::from_millis(150)),
            Outcome::Failure
        );
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
