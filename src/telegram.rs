// =============================================================================
// Telegram Signal Ingestion — long-polls getUpdates and parses signals
// =============================================================================
//
// The engine itself only consumes validated `Signal` values off a channel;
// this module is the ingestion collaborator that produces them. Malformed
// messages are logged and dropped here, never propagated.
//
// Expected message format:
//
//   SIGNAL
//   Symbol: BTCUSDT
//   Entry: 50000
//   Stop Loss: 49000
//   Take Profit: 52000
// =============================================================================

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::types::Signal;

pub struct TelegramPoller {
    http: reqwest::Client,
    token: String,
    /// Only messages from this chat are considered.
    chat_id: String,
    poll_timeout_secs: u64,
}

impl TelegramPoller {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>, poll_timeout_secs: u64) -> Self {
        // The long poll holds the request open for poll_timeout_secs, so the
        // client timeout must exceed it.
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(poll_timeout_secs + 10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            token: token.into(),
            chat_id: chat_id.into(),
            poll_timeout_secs,
        }
    }

    /// Poll forever, pushing parsed signals onto `tx`. Transport errors are
    /// logged and retried after a short sleep; the loop only exits when the
    /// receiving side is dropped.
    pub async fn run(self, tx: mpsc::Sender<Signal>) {
        info!(chat_id = %self.chat_id, "telegram signal poller started");
        let mut offset: i64 = 0;

        loop {
            match self.fetch_updates(offset).await {
                Ok(updates) => {
                    for (update_id, chat_id, text) in updates {
                        offset = offset.max(update_id + 1);

                        if chat_id != self.chat_id {
                            debug!(chat_id = %chat_id, "message from unconfigured chat ignored");
                            continue;
                        }
                        if !text.to_uppercase().contains("SIGNAL") {
                            continue;
                        }

                        match parse_signal(&text) {
                            Some(signal) => {
                                info!(?signal, "signal parsed from telegram message");
                                if tx.send(signal).await.is_err() {
                                    warn!("signal channel closed — stopping telegram poller");
                                    return;
                                }
                            }
                            None => {
                                warn!(text = %text, "malformed signal message dropped");
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "telegram getUpdates failed — retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// One getUpdates long poll. Returns `(update_id, chat_id, text)` tuples.
    async fn fetch_updates(&self, offset: i64) -> Result<Vec<(i64, String, String)>> {
        let url = format!(
            "https://api.telegram.org/bot{}/getUpdates?timeout={}&offset={}",
            self.token, self.poll_timeout_secs, offset
        );

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("telegram getUpdates request failed")?;

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse getUpdates response")?;

        if body["ok"].as_bool() != Some(true) {
            anyhow::bail!("telegram getUpdates returned not-ok: {body}");
        }

        let mut updates = Vec::new();
        for item in body["result"].as_array().map(|a| a.as_slice()).unwrap_or(&[]) {
            let update_id = match item["update_id"].as_i64() {
                Some(id) => id,
                None => continue,
            };
            let message = &item["message"];
            let chat_id = message["chat"]["id"]
                .as_i64()
                .map(|id| id.to_string())
                .unwrap_or_default();
            let text = message["text"].as_str().unwrap_or_default().to_string();
            updates.push((update_id, chat_id, text));
        }

        Ok(updates)
    }
}

impl std::fmt::Debug for TelegramPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramPoller")
            .field("token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a signal message into a `Signal`. Returns `None` when any field is
/// missing, unparseable, or fails price validation.
pub fn parse_signal(text: &str) -> Option<Signal> {
    let mut symbol: Option<String> = None;
    let mut entry_price: Option<f64> = None;
    let mut stop_loss: Option<f64> = None;
    let mut take_profit: Option<f64> = None;

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_lowercase().as_str() {
            "symbol" => symbol = Some(value.to_uppercase()),
            "entry" => entry_price = value.parse().ok(),
            "stop loss" => stop_loss = value.parse().ok(),
            "take profit" => take_profit = value.parse().ok(),
            _ => {}
        }
    }

    let signal = Signal {
        symbol: symbol?,
        entry_price: entry_price?,
        stop_loss: stop_loss?,
        take_profit: take_profit?,
    };

    signal.is_valid().then_some(signal)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "SIGNAL\nSymbol: BTCUSDT\nEntry: 50000\nStop Loss: 49000\nTake Profit: 52000";

    #[test]
    fn parses_well_formed_signal() {
        let signal = parse_signal(GOOD).unwrap();
        assert_eq!(signal.symbol, "BTCUSDT");
        assert!((signal.entry_price - 50000.0).abs() < f64::EPSILON);
        assert!((signal.stop_loss - 49000.0).abs() < f64::EPSILON);
        assert!((signal.take_profit - 52000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn tolerates_case_whitespace_and_decimals() {
        let text = "signal\n  symbol:  ethusdt\nENTRY: 3100.5\nStop loss: 3000.25\nTake Profit: 3400";
        let signal = parse_signal(text).unwrap();
        assert_eq!(signal.symbol, "ETHUSDT");
        assert!((signal.entry_price - 3100.5).abs() < f64::EPSILON);
        assert!((signal.stop_loss - 3000.25).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_field_is_rejected() {
        let text = "SIGNAL\nSymbol: BTCUSDT\nEntry: 50000\nTake Profit: 52000";
        assert!(parse_signal(text).is_none());
    }

    #[test]
    fn unparseable_price_is_rejected() {
        let text = "SIGNAL\nSymbol: BTCUSDT\nEntry: a lot\nStop Loss: 49000\nTake Profit: 52000";
        assert!(parse_signal(text).is_none());
    }

    #[test]
    fn non_positive_price_is_rejected() {
        let text = "SIGNAL\nSymbol: BTCUSDT\nEntry: 50000\nStop Loss: 0\nTake Profit: 52000";
        assert!(parse_signal(text).is_none());
    }

    #[test]
    fn unrelated_lines_are_ignored() {
        let text = format!("forwarded from somewhere\n{GOOD}\nnote: high conviction");
        assert!(parse_signal(&text).is_some());
    }
}
