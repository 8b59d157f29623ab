// Copyright (c) 2024 The Botho Foundation

//! Watcher configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{is_ton_address, CommentConvention};

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Main watcher configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DonateConfig {
    /// Ledger node access and watched addresses
    #[serde(default)]
    pub ledger: LedgerSourceConfig,

    /// Notification webhook
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Polling schedule
    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Ledger source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSourceConfig {
    /// TON HTTP API v2 base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// API key sent as `X-API-Key`
    #[serde(default)]
    pub api_key: Option<String>,

    /// Addresses to watch for incoming donations
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Layout of the payment comment
    #[serde(default)]
    pub comment_convention: CommentConvention,
}

/// Webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// URL payment notifications are POSTed to
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,

    /// Extra attempts within one delivery; re-scans retry regardless
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

/// Polling schedule configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Number of most recent transactions requested per cycle
    #[serde(default = "default_lookback")]
    pub lookback: u32,

    #[serde(default)]
    pub high_water_mark: HighWaterMark,

    /// Directory holding one state file per watched address
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

/// How far back each poll cycle looks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HighWaterMark {
    /// Re-scan the lookback window every cycle
    #[default]
    None,
    /// Persist the last processed transaction and only request newer ones
    Tracked,
}

fn default_api_url() -> String {
    "https://toncenter.com/api/v2".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_webhook_timeout() -> u64 {
    10
}

fn default_retry_delay() -> u64 {
    500
}

fn default_poll_interval() -> u64 {
    3
}

fn default_lookback() -> u32 {
    100
}

fn default_state_dir() -> String {
    "watch_state".to_string()
}

fn default_db_path() -> String {
    "ton-donate.db".to_string()
}

impl Default for LedgerSourceConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            addresses: Vec::new(),
            request_timeout_secs: default_request_timeout(),
            comment_convention: CommentConvention::default(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: default_webhook_timeout(),
            max_retries: 0,
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            lookback: default_lookback(),
            high_water_mark: HighWaterMark::default(),
            state_dir: default_state_dir(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl DonateConfig {
    /// Parse configuration from a TOML file without validating it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load the effective configuration.
    ///
    /// Reads `path` if it exists (defaults otherwise) and applies environment
    /// overrides. The result is not validated: admin commands only need the
    /// storage section.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from the deployment environment.
    ///
    /// `CONTRACT_ADDRESS` replaces the watched address list. `NOTIFICATION_URL`,
    /// `TON_API_URL`, `TON_API_KEY` and `DB_PATH` replace their settings.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(address) = get("CONTRACT_ADDRESS") {
            self.ledger.addresses = vec![address.trim().to_string()];
        }
        if let Some(url) = get("NOTIFICATION_URL") {
            self.webhook.url = url;
        }
        if let Some(url) = get("TON_API_URL") {
            self.ledger.api_url = url;
        }
        if let Some(key) = get("TON_API_KEY") {
            self.ledger.api_key = Some(key);
        }
        if let Some(path) = get("DB_PATH") {
            self.storage.db_path = path;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger.addresses.is_empty() {
            return Err(invalid("at least one watched address is required"));
        }
        for address in &self.ledger.addresses {
            if !is_ton_address(address) {
                return Err(invalid(format!("not a TON address: {}", address)));
            }
        }
        let mut seen = std::collections::HashSet::new();
        if !self.ledger.addresses.iter().all(|a| seen.insert(a)) {
            return Err(invalid("watched addresses must be distinct"));
        }

        check_http_url("ledger.api_url", &self.ledger.api_url)?;
        check_http_url("webhook.url", &self.webhook.url)?;

        if self.watch.poll_interval_secs == 0 {
            return Err(invalid("watch.poll_interval_secs must be > 0"));
        }
        if self.watch.lookback == 0 {
            return Err(invalid("watch.lookback must be > 0"));
        }
        if self.webhook.timeout_secs == 0 || self.ledger.request_timeout_secs == 0 {
            return Err(invalid("timeouts must be > 0"));
        }
        if self.storage.db_path.is_empty() {
            return Err(invalid("storage.db_path must not be empty"));
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn check_http_url(name: &str, value: &str) -> Result<(), ConfigError> {
    let url = url::Url::parse(value).map_err(|e| invalid(format!("{}: {}", name, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(format!("{}: unsupported scheme {}", name, other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const ADDRESS: &str = "EQDtFpEwcFAEcRe5mLVh2N6C0x-_hJEM7W61_JLnSF74p4q2";

    fn valid_config() -> DonateConfig {
        let mut config = DonateConfig::default();
        config.ledger.addresses = vec![ADDRESS.to_string()];
        config.webhook.url = "https://widgets.example.com/payments".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = DonateConfig::default();
        assert_eq!(config.watch.poll_interval_secs, 3);
        assert_eq!(config.watch.lookback, 100);
        assert_eq!(config.watch.high_water_mark, HighWaterMark::None);
        assert_eq!(config.webhook.max_retries, 0);
        assert_eq!(
            config.ledger.comment_convention,
            CommentConvention::DelimitedV1
        );
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_requires_address() {
        let mut config = valid_config();
        config.ledger.addresses.clear();
        assert!(config.validate().is_err());

        config.ledger.addresses = vec!["not-an-address".to_string()];
        assert!(config.validate().is_err());

        config.ledger.addresses = vec![ADDRESS.to_string(), ADDRESS.to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_interval_and_lookback() {
        let mut config = valid_config();
        config.watch.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.watch.lookback = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_webhook_url() {
        let mut config = valid_config();
        config.webhook.url = String::new();
        assert!(config.validate().is_err());

        config.webhook.url = "ftp://widgets.example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml = format!(
            r#"
            [ledger]
            addresses = ["{}"]
            comment_convention = "plain"

            [webhook]
            url = "http://localhost:9000/payments"
            max_retries = 2

            [watch]
            high_water_mark = "tracked"
            lookback = 20
            "#,
            ADDRESS
        );
        let config: DonateConfig = toml::from_str(&toml).unwrap();
        assert_eq!(config.ledger.comment_convention, CommentConvention::Plain);
        assert_eq!(config.watch.high_water_mark, HighWaterMark::Tracked);
        assert_eq!(config.watch.lookback, 20);
        assert_eq!(config.watch.poll_interval_secs, 3);
        assert_eq!(config.webhook.max_retries, 2);
        assert_eq!(config.storage.db_path, "ton-donate.db");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CONTRACT_ADDRESS", ADDRESS),
            ("NOTIFICATION_URL", "https://hooks.example.com/p"),
            ("TON_API_KEY", "secret"),
            ("DB_PATH", ""),
        ]
        .into_iter()
        .collect();

        let mut config = DonateConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.ledger.addresses, vec![ADDRESS.to_string()]);
        assert_eq!(config.webhook.url, "https://hooks.example.com/p");
        assert_eq!(config.ledger.api_key.as_deref(), Some("secret"));
        assert_eq!(config.storage.db_path, "ton-donate.db");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = DonateConfig::from_file(dir.path().join("missing.toml"));
        assert!(matches!(config, Err(ConfigError::Io(_))));
    }
}
