// =============================================================================
// Binance USDT-M Futures REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and Binance servers.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::gateway::ExchangeGateway;
use crate::types::{Order, OrderKind, OrderSide, OrderStatus};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

const MAINNET_REST: &str = "https://fapi.binance.com";
const TESTNET_REST: &str = "https://testnet.binancefuture.com";
const MAINNET_WS: &str = "wss://fstream.binance.com";
const TESTNET_WS: &str = "wss://stream.binancefuture.com";

/// Binance futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceClient {
    api_key: String,
    secret: String,
    base_url: String,
    ws_base: String,
    client: reqwest::Client,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BinanceClient`.
    ///
    /// # Arguments
    /// * `api_key` — Binance API key (sent as a header, never in query params).
    /// * `secret`  — Binance secret key used exclusively for HMAC signing.
    /// * `testnet` — target the futures testnet instead of production.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let (base_url, ws_base) = if testnet {
            (TESTNET_REST, TESTNET_WS)
        } else {
            (MAINNET_REST, MAINNET_WS)
        };

        debug!(base_url, testnet, "BinanceClient initialised");

        Self {
            api_key,
            secret,
            base_url: base_url.to_string(),
            ws_base: ws_base.to_string(),
            client,
        }
    }

    /// WebSocket base url for the configured environment.
    pub fn ws_base(&self) -> &str {
        &self.ws_base
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Order placement
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/order (signed) — submit a conditional order.
    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: OrderKind,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<Order> {
        let params = format!(
            "symbol={symbol}&side={}&type={}&quantity={quantity}&stopPrice={trigger_price}",
            side.as_str(),
            kind.binance_type(),
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, side = %side, kind = %kind, quantity, trigger_price, "placing order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /fapi/v1/order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse order response")?;

        if !status.is_success() {
            anyhow::bail!("Binance POST /fapi/v1/order returned {}: {}", status, body);
        }

        let order_id = body["orderId"]
            .as_u64()
            .context("order response missing orderId")?;
        let order_status = OrderStatus::parse(
            body["status"]
                .as_str()
                .context("order response missing status")?,
        )?;

        debug!(symbol, order_id, status = %order_status, "order placed");

        Ok(Order {
            order_id,
            symbol: symbol.to_string(),
            side,
            kind,
            trigger_price,
            quantity,
            status: order_status,
        })
    }
}

// ---------------------------------------------------------------------------
// Gateway implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ExchangeGateway for BinanceClient {
    #[instrument(skip(self), name = "binance::place_entry")]
    async fn place_entry(
        &self,
        symbol: &str,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<Order> {
        self.place_order(
            symbol,
            OrderSide::Buy,
            OrderKind::StopMarketEntry,
            quantity,
            trigger_price,
        )
        .await
    }

    #[instrument(skip(self), name = "binance::place_exit")]
    async fn place_exit(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: OrderKind,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<Order> {
        self.place_order(symbol, side, kind, quantity, trigger_price)
            .await
    }

    /// DELETE /fapi/v1/order (signed) — cancel an existing order.
    ///
    /// Binance refuses cancels of already-terminal orders with error -2011;
    /// that is signalled as `Ok(false)` rather than an error, since the
    /// engine issues such cancels by design.
    #[instrument(skip(self), name = "binance::cancel")]
    async fn cancel(&self, symbol: &str, order_id: u64) -> Result<bool> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, order_id, "cancelling order");

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .context("DELETE /fapi/v1/order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse cancel response")?;

        if !status.is_success() {
            // -2011: "Unknown order sent" — already filled/cancelled/expired.
            if body["code"].as_i64() == Some(-2011) {
                debug!(symbol, order_id, "cancel refused — order already terminal");
                return Ok(false);
            }
            anyhow::bail!(
                "Binance DELETE /fapi/v1/order returned {}: {}",
                status,
                body
            );
        }

        debug!(symbol, order_id, "order cancelled");
        Ok(true)
    }

    /// GET /fapi/v1/order (signed) — query a single order's status.
    #[instrument(skip(self), name = "binance::query_status")]
    async fn query_status(&self, symbol: &str, order_id: u64) -> Result<OrderStatus> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse order query response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /fapi/v1/order returned {}: {}", status, body);
        }

        let order_status = OrderStatus::parse(
            body["status"]
                .as_str()
                .context("order query response missing status")?,
        )?;

        debug!(symbol, order_id, status = %order_status, "order status queried");
        Ok(order_status)
    }
}

// ---------------------------------------------------------------------------
// User-data stream listen key
// ---------------------------------------------------------------------------

impl BinanceClient {
    /// POST /fapi/v1/listenKey — obtain a user-data stream listen key.
    /// Requires only the API key header, not a signature.
    #[instrument(skip(self), name = "binance::create_listen_key")]
    pub async fn create_listen_key(&self) -> Result<String> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /fapi/v1/listenKey request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse listenKey response")?;

        if !status.is_success() {
            anyhow::bail!(
                "Binance POST /fapi/v1/listenKey returned {}: {}",
                status,
                body
            );
        }

        let key = body["listenKey"]
            .as_str()
            .context("listenKey response missing listenKey")?
            .to_string();

        debug!("listen key created");
        Ok(key)
    }

    /// PUT /fapi/v1/listenKey — keep the user-data stream alive. Binance
    /// expires listen keys after 60 minutes without a keepalive.
    #[instrument(skip(self), name = "binance::keepalive_listen_key")]
    pub async fn keepalive_listen_key(&self) -> Result<()> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);

        let resp = self
            .client
            .put(&url)
            .send()
            .await
            .context("PUT /fapi/v1/listenKey request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, body, "listen key keepalive failed");
            anyhow::bail!("Binance PUT /fapi/v1/listenKey returned {status}");
        }

        debug!("listen key keepalive sent");
        Ok(())
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
