// Copyright (c) 2024 The Botho Foundation

//! Ledger transaction sources.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use ton_donate_core::{Cursor, LedgerSourceConfig, RawTransaction};

/// Errors fetching transactions. All of them are transient from the watch
/// loop's point of view: the cycle is skipped and retried on the next tick.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("ledger API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("ledger API error: {0}")]
    Api(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Yields recent transactions of a watched address.
#[async_trait]
pub trait LedgerTransactionSource: Send + Sync {
    /// Fetch up to `limit` of the most recent transactions of `address`,
    /// restricted to those after `since` when given.
    ///
    /// Implementations return transactions oldest first and may return fewer
    /// than `limit`.
    async fn list(
        &self,
        address: &str,
        limit: u32,
        since: Option<&Cursor>,
    ) -> Result<Vec<RawTransaction>, SourceError>;

    /// Fetch up to `limit` transactions immediately preceding `before`,
    /// oldest first.
    ///
    /// Used to page back when more than `limit` transactions arrived after a
    /// high-water mark.
    async fn list_before(
        &self,
        address: &str,
        limit: u32,
        before: &Cursor,
    ) -> Result<Vec<RawTransaction>, SourceError>;
}

/// Response envelope of the TON HTTP API v2.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<Vec<RawTransaction>>,
    #[serde(default)]
    error: Option<String>,
}

/// Source backed by a toncenter-compatible HTTP API.
///
/// The API lists transactions newest first; this adapter reverses them so
/// callers see ledger order.
pub struct TonCenterSource {
    client: Client,
    api_url: String,
    api_key: Option<String>,
}

impl TonCenterSource {
    pub fn new(api_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn from_config(config: &LedgerSourceConfig) -> Result<Self, SourceError> {
        Self::new(
            &config.api_url,
            config.api_key.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }
}

impl TonCenterSource {
    /// One `getTransactions` call. The node answers newest first.
    async fn fetch(&self, query: &[(&str, String)]) -> Result<Vec<RawTransaction>, SourceError> {
        let mut request = self
            .client
            .get(format!("{}/getTransactions", self.api_url))
            .query(query);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let parsed: ApiResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(SourceError::Status {
                    status: status.as_u16(),
                    body: body.chars().take(200).collect(),
                })
            }
            Err(e) => return Err(SourceError::InvalidResponse(e.to_string())),
        };

        if !parsed.ok {
            return Err(SourceError::Api(
                parsed.error.unwrap_or_else(|| format!("status {}", status)),
            ));
        }

        parsed
            .result
            .ok_or_else(|| SourceError::InvalidResponse("missing result".to_string()))
    }
}

#[async_trait]
impl LedgerTransactionSource for TonCenterSource {
    async fn list(
        &self,
        address: &str,
        limit: u32,
        since: Option<&Cursor>,
    ) -> Result<Vec<RawTransaction>, SourceError> {
        let mut query = vec![
            ("address", address.to_string()),
            ("limit", limit.to_string()),
            ("archival", "true".to_string()),
        ];
        if let Some(cursor) = since {
            query.push(("to_lt", cursor.lt.to_string()));
        }

        let mut transactions = self.fetch(&query).await?;

        // `to_lt` is exclusive on the node side; filter again in case a node
        // treats it differently.
        if let Some(cursor) = since {
            transactions.retain(|tx| tx.lt().map_or(true, |lt| lt > cursor.lt));
        }
        transactions.sort_by_key(|tx| tx.lt().unwrap_or(0));

        Ok(transactions)
    }

    async fn list_before(
        &self,
        address: &str,
        limit: u32,
        before: &Cursor,
    ) -> Result<Vec<RawTransaction>, SourceError> {
        // `lt`/`hash` start the listing at `before` itself, so ask for one more.
        let query = vec![
            ("address", address.to_string()),
            ("limit", limit.saturating_add(1).to_string()),
            ("lt", before.lt.to_string()),
            ("hash", before.hash.clone()),
            ("archival", "true".to_string()),
        ];

        let mut transactions = self.fetch(&query).await?;
        transactions.retain(|tx| tx.lt().map_or(true, |lt| lt < before.lt));
        transactions.sort_by_key(|tx| tx.lt().unwrap_or(0));
        let excess = transactions.len().saturating_sub(limit as usize);
        transactions.drain(..excess);

        Ok(transactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer a single request, returning its request line.
    async fn spawn_api(
        status: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut read = 0;
            while !String::from_utf8_lossy(&buf[..read]).contains("\r\n\r\n") {
                let n = socket.read(&mut buf[read..]).await.unwrap();
                if n == 0 {
                    break;
                }
                read += n;
            }
            let request = String::from_utf8_lossy(&buf[..read]).to_string();

            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();

            request.lines().next().unwrap_or_default().to_string()
        });

        (format!("http://{}/api/v2/", addr), handle)
    }

    const TWO_TXS: &str = r#"{"ok": true, "result": [
        {"utime": 2, "transaction_id": {"lt": "200", "hash": "h200"},
         "in_msg": {"source": "src", "value": "20", "message": "b"}},
        {"utime": 1, "transaction_id": {"lt": "100", "hash": "h100"},
         "in_msg": {"source": "src", "value": "10", "message": "a"}}
    ]}"#;

    #[tokio::test]
    async fn test_list_returns_oldest_first() {
        let (url, handle) = spawn_api("200 OK", TWO_TXS).await;
        let source = TonCenterSource::new(&url, Some("key".to_string()), Duration::from_secs(5))
            .unwrap();

        let txs = source.list("EQaddr", 100, None).await.unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].transaction_id.hash, "h100");
        assert_eq!(txs[1].transaction_id.hash, "h200");

        let request_line = handle.await.unwrap();
        assert!(request_line.starts_with("GET /api/v2/getTransactions?"));
        assert!(request_line.contains("address=EQaddr"));
        assert!(request_line.contains("limit=100"));
        assert!(!request_line.contains("to_lt"));
    }

    #[tokio::test]
    async fn test_list_since_cursor() {
        let (url, handle) = spawn_api("200 OK", TWO_TXS).await;
        let source = TonCenterSource::new(&url, None, Duration::from_secs(5)).unwrap();
        let cursor = Cursor {
            lt: 100,
            hash: "h100".to_string(),
        };

        let txs = source.list("EQaddr", 10, Some(&cursor)).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].transaction_id.hash, "h200");
        assert!(handle.await.unwrap().contains("to_lt=100"));
    }

    #[tokio::test]
    async fn test_api_error() {
        let (url, _handle) = spawn_api(
            "500 Internal Server Error",
            r#"{"ok": false, "error": "LITE_SERVER_UNKNOWN", "code": 500}"#,
        )
        .await;
        let source = TonCenterSource::new(&url, None, Duration::from_secs(5)).unwrap();

        match source.list("EQaddr", 10, None).await {
            Err(SourceError::Api(msg)) => assert_eq!(msg, "LITE_SERVER_UNKNOWN"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_json_error_status() {
        let (url, _handle) = spawn_api("502 Bad Gateway", "bad gateway").await;
        let source = TonCenterSource::new(&url, None, Duration::from_secs(5)).unwrap();

        assert!(matches!(
            source.list("EQaddr", 10, None).await,
            Err(SourceError::Status { status: 502, .. })
        ));
    }

    const PAGE_FROM_200: &str = r#"{"ok": true, "result": [
        {"utime": 2, "transaction_id": {"lt": "200", "hash": "h200"},
         "in_msg": {"source": "src", "value": "20", "message": "b"}},
        {"utime": 1, "transaction_id": {"lt": "150", "hash": "h150"},
         "in_msg": {"source": "src", "value": "15", "message": "c"}},
        {"utime": 1, "transaction_id": {"lt": "100", "hash": "h100"},
         "in_msg": {"source": "src", "value": "10", "message": "a"}}
    ]}"#;

    #[tokio::test]
    async fn test_list_before_pages_back() {
        let (url, handle) = spawn_api("200 OK", PAGE_FROM_200).await;
        let source = TonCenterSource::new(&url, None, Duration::from_secs(5)).unwrap();
        let before = Cursor {
            lt: 200,
            hash: "h200".to_string(),
        };

        let txs = source.list_before("EQaddr", 2, &before).await.unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].transaction_id.hash, "h100");
        assert_eq!(txs[1].transaction_id.hash, "h150");

        let request_line = handle.await.unwrap();
        assert!(request_line.contains("limit=3"));
        assert!(request_line.contains("lt=200"));
        assert!(request_line.contains("hash=h200"));
    }
}
