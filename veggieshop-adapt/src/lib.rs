//! The outbox drainer's only external dependency: a place to publish a
//! claimed row's payload. Kept as a narrow trait rather than a concrete
//! message-bus client, the same way the teacher's networking layer kept
//! message send/receive behind a queue rather than a transport-specific
//! API -- the drainer doesn't know or care whether `publish` ends up on
//! Kafka, NATS, or an HTTP webhook.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Outcome of a publish attempt. `Rejected` is a signal that retrying will
/// never succeed (a malformed payload, an unknown topic); the outbox
/// drainer treats it the same as exhausting `max_attempts`.
#[derive(Clone, Debug)]
pub enum PublishOutcome {
    Published { partition: Option<i32>, offset: Option<i64> },
    Retryable(String),
    Rejected(String),
}

#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: &[u8],
        value: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> PublishOutcome;
}

/// Records every call it receives; publishes succeed unconditionally.
/// Used by `veggieshop-outbox`'s own tests and by any integration test
/// that wants to assert on what was published without a real bus.
#[derive(Default)]
pub struct InMemoryPublisher {
    published: Mutex<Vec<PublishedMessage>>,
}

#[derive(Clone, Debug)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().expect("publisher mutex poisoned").clone()
    }
}

#[async_trait::async_trait]
impl Publisher for InMemoryPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: &[u8],
        value: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> PublishOutcome {
        let mut guard = self.published.lock().expect("publisher mutex poisoned");
        let offset = guard.len() as i64;
        guard.push(PublishedMessage {
            topic: topic.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
            headers: headers.clone(),
        });
        PublishOutcome::Published {
            partition: Some(0),
            offset: Some(offset),
        }
    }
}

/// A publisher that logs via `tracing` and reports success, useful for
/// local development when no real message bus is configured.
pub struct LoggingPublisher;

#[async_trait::async_trait]
impl Publisher for LoggingPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: &[u8],
        value: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> PublishOutcome {
        tracing::info!(
            target: "veggieshop",
            topic,
            key_len = key.len(),
            value_len = value.len(),
            headers = ?headers,
            "publish"
        );
        PublishOutcome::Published {
            partition: None,
            offset: None,
        }
    }
}

/// Delivers a claimed row to a downstream HTTP endpoint: `POST
/// {base_url}/{topic}` with `value` as the body and `headers` (plus
/// `x-event-key`, base64-encoded since keys are arbitrary bytes) as HTTP
/// headers. Status code drives the outcome the same way the drainer's
/// retry/quarantine split expects: 2xx is a success, 4xx is a permanent
/// rejection (retrying a malformed request never helps), everything else
/// (5xx, timeout, connection failure) is retryable.
pub struct HttpWebhookPublisher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWebhookPublisher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, std::time::Duration::from_secs(10))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builds with a finite timeout");
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl Publisher for HttpWebhookPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: &[u8],
        value: &[u8],
        headers: &BTreeMap<String, String>,
    ) -> PublishOutcome {
        use base64::Engine;

        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), topic);
        let mut request = self.client.post(&url).body(value.to_vec());
        for (name, val) in headers {
            request = request.header(name.as_str(), val.as_str());
        }
        if !key.is_empty() {
            request = request.header("x-event-key", base64::engine::general_purpose::STANDARD.encode(key));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    PublishOutcome::Published { partition: None, offset: None }
                } else if status.is_client_error() {
                    PublishOutcome::Rejected(format!("webhook returned {status}"))
                } else {
                    PublishOutcome::Retryable(format!("webhook returned {status}"))
                }
            }
            Err(err) => PublishOutcome::Retryable(format!("webhook request failed: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_publisher_records_messages() {
        let p = InMemoryPublisher::new();
        let mut headers = BTreeMap::new();
        headers.insert("x-tenant-id".to_string(), "acme".to_string());
        let outcome = p.publish("orders", b"key1", b"value1", &headers).await;
        assert!(matches!(outcome, PublishOutcome::Published { .. }));
        let published = p.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "orders");
        assert_eq!(published[0].headers.get("x-tenant-id").unwrap(), "acme");
    }

    #[tokio::test]
    async fn logging_publisher_always_succeeds() {
        let p = LoggingPublisher;
        let outcome = p.publish("orders", b"k", b"v", &BTreeMap::new()).await;
        assert!(matches!(outcome, PublishOutcome::Published { .. }));
    }

    #[tokio::test]
    async fn webhook_publisher_treats_2xx_as_published() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let publisher = HttpWebhookPublisher::new(server.uri());
        let outcome = publisher.publish("orders", b"key1", b"value1", &BTreeMap::new()).await;
        assert!(matches!(outcome, PublishOutcome::Published { .. }));
    }

    #[tokio::test]
    async fn webhook_publisher_treats_4xx_as_rejected() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(422))
            .mount(&server)
            .await;

        let publisher = HttpWebhookPublisher::new(server.uri());
        let outcome = publisher.publish("orders", b"key1", b"value1", &BTreeMap::new()).await;
        assert!(matches!(outcome, PublishOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn webhook_publisher_treats_5xx_as_retryable() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let publisher = HttpWebhookPublisher::new(server.uri());
        let outcome = publisher.publish("orders", b"key1", b"value1", &BTreeMap::new()).await;
        assert!(matches!(outcome, PublishOutcome::Retryable(_)));
    }

    #[tokio::test]
    async fn webhook_publisher_forwards_headers_and_key() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(header("x-tenant-id", "acme"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let publisher = HttpWebhookPublisher::new(server.uri());
        let mut headers = BTreeMap::new();
        headers.insert("x-tenant-id".to_string(), "acme".to_string());
        let outcome = publisher.publish("orders", b"key1", b"value1", &headers).await;
        assert!(matches!(outcome, PublishOutcome::Published { .. }));
    }
}
