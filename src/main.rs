// =============================================================================
// Bracket Bot — Main Entry Point
// =============================================================================
//
// Signals flow: Telegram poller → signal channel → lifecycle manager, which
// drives each trade through entry placement, fill wait, and the OCO exit
// race. Order events flow: user-data stream → event channel → event bridge,
// with the reconcile loop backfilling anything the stream missed.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod binance;
mod bridge;
mod config;
mod entry;
mod exits;
mod gateway;
mod lifecycle;
mod reconcile;
mod telegram;
mod types;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::client::BinanceClient;
use crate::bridge::OrderEventBridge;
use crate::config::{Config, Secrets};
use crate::lifecycle::TradeLifecycleManager;
use crate::telegram::TelegramPoller;

const CONFIG_PATH: &str = "bracket_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Bracket Bot starting up");

    let config = Config::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        Config::default()
    });

    info!(
        testnet = config.testnet,
        order_quantity = config.order_quantity,
        max_retries = config.max_retries,
        retry_delay_secs = config.retry_delay_secs,
        entry_fill_timeout_secs = ?config.entry_fill_timeout_secs,
        "configuration"
    );

    let secrets = Secrets::from_env()?;

    // ── 2. Exchange client & event bridge ────────────────────────────────
    let client = Arc::new(BinanceClient::new(
        secrets.binance_api_key.clone(),
        secrets.binance_api_secret.clone(),
        config.testnet,
    ));
    let bridge = Arc::new(OrderEventBridge::new());

    // ── 3. User-data stream (order events) ───────────────────────────────
    let (event_tx, event_rx) = mpsc::channel(256);
    let reconnect_sleep = tokio::time::Duration::from_secs(config.stream_reconnect_secs);

    {
        let stream_client = client.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    binance::user_stream::run_user_stream(&stream_client, &event_tx).await
                {
                    error!(error = %e, "user-data stream error — reconnecting");
                }
                tokio::time::sleep(reconnect_sleep).await;
            }
        });
    }

    tokio::spawn(binance::user_stream::run_keepalive(client.clone()));

    {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.run(event_rx).await });
    }

    // ── 4. Reconcile loop (backfills events missed during stream gaps) ───
    tokio::spawn(reconcile::run_reconcile_loop(
        client.clone(),
        bridge.clone(),
        tokio::time::Duration::from_secs(config.reconcile_interval_secs),
    ));

    // ── 5. Lifecycle manager & signal ingestion ──────────────────────────
    let (signal_tx, signal_rx) = mpsc::channel(64);

    let manager = Arc::new(TradeLifecycleManager::new(
        client.clone(),
        bridge.clone(),
        config.clone(),
    ));
    tokio::spawn(manager.clone().run(signal_rx));

    if secrets.telegram_bot_token.is_empty() || secrets.telegram_chat_id.is_empty() {
        warn!("TELEGRAM_BOT_TOKEN / TELEGRAM_CHAT_ID not set — signal ingestion disabled");
    } else {
        let poller = TelegramPoller::new(
            secrets.telegram_bot_token.clone(),
            secrets.telegram_chat_id.clone(),
            config.signal_poll_timeout_secs,
        );
        tokio::spawn(poller.run(signal_tx.clone()));
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping");

    let active = manager.active_trades();
    if !active.is_empty() {
        warn!(
            count = active.len(),
            "live trades abandoned in-memory — their exchange orders remain open"
        );
    }

    info!("Bracket Bot shut down complete.");
    Ok(())
}
