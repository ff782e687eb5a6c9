// =============================================================================
// Runtime Configuration — engine settings with atomic save, secrets from env
// =============================================================================
//
// All tunable parameters live here. Persistence uses an atomic tmp + rename
// pattern to prevent corruption on crash. All fields carry `#[serde(default)]`
// so that adding new fields never breaks loading an older config file.
//
// Credentials are never part of the JSON file: they come from the environment
// (see `Secrets`), typically via a .env file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_order_quantity() -> f64 {
    0.001
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_stream_reconnect_secs() -> u64 {
    5
}

fn default_signal_poll_timeout_secs() -> u64 {
    30
}

// =============================================================================
// Config
// =============================================================================

/// Top-level runtime configuration for the bracket engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Whether to target the Binance futures testnet. Defaults to `true` so
    /// a fresh deployment can never touch real funds by accident.
    #[serde(default = "default_true")]
    pub testnet: bool,

    /// Fixed position size per trade, in base asset units.
    #[serde(default = "default_order_quantity")]
    pub order_quantity: f64,

    /// Maximum entry placement attempts before giving up on a signal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between entry placement attempts.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Optional bound on how long to wait for the entry order to fill.
    /// `None` (the default) waits indefinitely, matching the exchange's own
    /// order lifetime. When set, a timed-out entry is cancelled and the
    /// trade aborted.
    #[serde(default)]
    pub entry_fill_timeout_secs: Option<u64>,

    /// How often the reconcile loop queries pending orders directly,
    /// catching events missed during a stream reconnect gap.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Sleep between user-data stream reconnect attempts.
    #[serde(default = "default_stream_reconnect_secs")]
    pub stream_reconnect_secs: u64,

    /// Telegram getUpdates long-poll timeout.
    #[serde(default = "default_signal_poll_timeout_secs")]
    pub signal_poll_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            testnet: true,
            order_quantity: default_order_quantity(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            entry_fill_timeout_secs: None,
            reconcile_interval_secs: default_reconcile_interval_secs(),
            stream_reconnect_secs: default_stream_reconnect_secs(),
            signal_poll_timeout_secs: default_signal_poll_timeout_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            testnet = config.testnet,
            order_quantity = config.order_quantity,
            max_retries = config.max_retries,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn entry_fill_timeout(&self) -> Option<Duration> {
        self.entry_fill_timeout_secs.map(Duration::from_secs)
    }
}

// =============================================================================
// Secrets
// =============================================================================

/// Credentials pulled from the environment, never from the config file.
#[derive(Clone)]
pub struct Secrets {
    pub binance_api_key: String,
    pub binance_api_secret: String,
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,
}

impl Secrets {
    /// Read all secrets from the environment. Missing Binance credentials are
    /// an error; Telegram credentials are optional (empty disables ingestion).
    pub fn from_env() -> Result<Self> {
        let binance_api_key =
            std::env::var("BINANCE_API_KEY").context("BINANCE_API_KEY not set")?;
        let binance_api_secret =
            std::env::var("BINANCE_API_SECRET").context("BINANCE_API_SECRET not set")?;
        let telegram_bot_token = std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        let telegram_chat_id = std::env::var("TELEGRAM_CHAT_ID").unwrap_or_default();

        Ok(Self {
            binance_api_key,
            binance_api_secret,
            telegram_bot_token,
            telegram_chat_id,
        })
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("binance_api_key", &"<redacted>")
            .field("binance_api_secret", &"<redacted>")
            .field("telegram_bot_token", &"<redacted>")
            .field("telegram_chat_id", &self.telegram_chat_id)
            .finish()
    }
}
