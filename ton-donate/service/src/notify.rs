// Copyright (c) 2024 The Botho Foundation

//! Payment notification delivery.
//!
//! A confirmed donation is announced to the overlay widget backend with a
//! JSON POST. The backend answers `201 Created` when it accepted the event;
//! anything else leaves the donation unacknowledged so the next scan of the
//! same transaction delivers it again.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ton_donate_core::WebhookConfig;

/// Body of a payment notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Ledger-confirmed amount in nanotons
    pub amount: u64,
    pub nickname: String,
    pub text: String,
    /// Streamer the widget belongs to
    #[serde(rename = "clientId")]
    pub client_id: String,
}

/// Delivery failure classes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    /// May succeed if delivered again later
    #[error("retryable: {0}")]
    Retryable(String),

    /// Will never succeed as built
    #[error("permanent: {0}")]
    Permanent(String),
}

impl NotifyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, NotifyError::Retryable(_))
    }
}

/// Delivers payment notifications.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), NotifyError>;
}

/// Dispatcher that POSTs notifications to a webhook URL.
pub struct WebhookDispatcher {
    /// HTTP client
    client: Client,
    /// Webhook URL
    url: String,
    /// Extra attempts within one `send`
    max_retries: u32,
    /// Base delay between attempts
    retry_delay: Duration,
}

impl WebhookDispatcher {
    /// Create a dispatcher with a single attempt per send.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Permanent(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.to_string(),
            max_retries: 0,
            retry_delay: Duration::from_millis(500),
        })
    }

    pub fn from_config(config: &WebhookConfig) -> Result<Self, NotifyError> {
        Ok(Self::new(&config.url, Duration::from_secs(config.timeout_secs))?
            .with_retries(config.max_retries, Duration::from_millis(config.retry_delay_ms)))
    }

    /// Set in-call retry settings.
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post_once(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| NotifyError::Retryable(format!("webhook request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::CREATED {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Retryable(format!(
            "webhook returned {}: {}",
            status,
            body.chars().take(200).collect::<String>()
        )))
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookDispatcher {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        if payload.client_id.is_empty() {
            return Err(NotifyError::Permanent(
                "notification has no client id".to_string(),
            ));
        }

        let mut attempt = 0;
        loop {
            match self.post_once(payload).await {
                Ok(()) => {
                    tracing::debug!(
                        "Webhook accepted notification for {} ({} nanotons)",
                        payload.client_id,
                        payload.amount
                    );
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!("Webhook retry {} for {}: {}", attempt, payload.client_id, e);
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response per connection, in order, capturing bodies.
    async fn spawn_webhook(
        statuses: Vec<&'static str>,
    ) -> (String, Arc<AtomicUsize>, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let handle = tokio::spawn(async move {
            let mut bodies = Vec::new();
            for status in statuses {
                let (mut socket, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);

                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                loop {
                    let n = socket.read(&mut buf[read..]).await.unwrap();
                    read += n;
                    let text = String::from_utf8_lossy(&buf[..read]).to_string();
                    if let Some(end) = text.find("\r\n\r\n") {
                        let length = text
                            .lines()
                            .find_map(|l| {
                                l.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap())
                            })
                            .unwrap_or(0);
                        if read >= end + 4 + length || n == 0 {
                            bodies.push(text[end + 4..].to_string());
                            break;
                        }
                    }
                    if n == 0 {
                        break;
                    }
                }

                let response = format!(
                    "HTTP/1.1 {}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                    status
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
            bodies
        });

        (format!("http://{}/payments", addr), hits, handle)
    }

    fn payload() -> NotificationPayload {
        NotificationPayload {
            amount: 500,
            nickname: "alice".to_string(),
            text: "hello".to_string(),
            client_id: "streamer-1".to_string(),
        }
    }

    #[test]
    fn test_payload_wire_format() {
        let json = serde_json::to_value(payload()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "amount": 500,
                "nickname": "alice",
                "text": "hello",
                "clientId": "streamer-1"
            })
        );
    }

    #[tokio::test]
    async fn test_created_is_success() {
        let (url, hits, handle) = spawn_webhook(vec!["201 Created"]).await;
        let dispatcher = WebhookDispatcher::new(&url, Duration::from_secs(5)).unwrap();

        dispatcher.send(&payload()).await.unwrap();

        let bodies = handle.await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let sent: NotificationPayload = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(sent, payload());
    }

    #[tokio::test]
    async fn test_ok_is_not_created() {
        let (url, _hits, _handle) = spawn_webhook(vec!["200 OK"]).await;
        let dispatcher = WebhookDispatcher::new(&url, Duration::from_secs(5)).unwrap();

        let err = dispatcher.send(&payload()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_retries_within_send() {
        let (url, hits, _handle) =
            spawn_webhook(vec!["503 Service Unavailable", "201 Created"]).await;
        let dispatcher = WebhookDispatcher::new(&url, Duration::from_secs(5))
            .unwrap()
            .with_retries(1, Duration::from_millis(10));

        dispatcher.send(&payload()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dispatcher =
            WebhookDispatcher::new(&format!("http://{}/payments", addr), Duration::from_secs(2))
                .unwrap();
        let err = dispatcher.send(&payload()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_client_id_is_permanent() {
        let dispatcher =
            WebhookDispatcher::new("http://127.0.0.1:9/payments", Duration::from_secs(1)).unwrap();
        let mut p = payload();
        p.client_id.clear();

        assert!(matches!(
            dispatcher.send(&p).await,
            Err(NotifyError::Permanent(_))
        ));
    }
}
