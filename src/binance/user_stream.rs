// =============================================================================
// User-Data Stream — order events off the Binance futures websocket
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::binance::client::BinanceClient;
use crate::types::{OrderStatus, OrderUpdate};

/// Binance expires listen keys after 60 minutes; refresh at half that.
const KEEPALIVE_INTERVAL_SECS: u64 = 30 * 60;

/// Connect to the user-data stream and forward order events into `tx`.
///
/// Runs until the stream disconnects or an error occurs, then returns so that
/// the caller (main.rs) can handle reconnection. A fresh listen key is
/// fetched on every connect, so a reconnect also recovers from key expiry.
pub async fn run_user_stream(
    client: &BinanceClient,
    tx: &mpsc::Sender<OrderUpdate>,
) -> Result<()> {
    let listen_key = client
        .create_listen_key()
        .await
        .context("failed to obtain listen key for user stream")?;

    let url = format!("{}/ws/{}", client.ws_base(), listen_key);
    info!("connecting to user-data stream");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to user-data stream")?;

    info!("user-data stream connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_order_update(&text) {
                        Ok(Some(update)) => {
                            debug!(
                                order_id = update.order_id,
                                status = %update.status,
                                "order event received"
                            );
                            if tx.send(update).await.is_err() {
                                warn!("order event channel closed — stopping user stream");
                                return Ok(());
                            }
                        }
                        Ok(None) => {} // event type we don't care about
                        Err(e) => {
                            warn!(error = %e, "failed to parse user-stream message");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(error = %e, "user-data stream read error");
                return Err(e.into());
            }
            None => {
                warn!("user-data stream ended");
                return Ok(());
            }
        }
    }
}

/// Keep the listen key alive. Spawned once at startup and runs forever;
/// failures are logged and retried on the next tick (a dead key is also
/// recovered by the stream reconnect, which fetches a fresh one).
pub async fn run_keepalive(client: Arc<BinanceClient>) {
    let mut ticker =
        tokio::time::interval(tokio::time::Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
    ticker.tick().await; // immediate first tick — skip

    loop {
        ticker.tick().await;
        if let Err(e) = client.keepalive_listen_key().await {
            warn!(error = %e, "listen key keepalive failed — will retry");
        }
    }
}

/// Parse a user-stream frame into an order update.
///
/// Expected shape for the event we care about:
/// ```json
/// { "e": "ORDER_TRADE_UPDATE", "o": { "i": 123456, "X": "FILLED" } }
/// ```
/// Other event types yield `Ok(None)`.
fn parse_order_update(text: &str) -> Result<Option<OrderUpdate>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse user-stream JSON")?;

    if root["e"].as_str() != Some("ORDER_TRADE_UPDATE") {
        return Ok(None);
    }

    let order = &root["o"];
    let order_id = order["i"]
        .as_u64()
        .context("ORDER_TRADE_UPDATE missing order id field i")?;
    let status = OrderStatus::parse(
        order["X"]
            .as_str()
            .context("ORDER_TRADE_UPDATE missing status field X")?,
    )?;

    Ok(Some(OrderUpdate { order_id, status }))
}
