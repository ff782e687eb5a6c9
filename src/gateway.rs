// =============================================================================
// Exchange Gateway seam — the trait the engine trades through
// =============================================================================
//
// The lifecycle engine never talks to Binance directly; it goes through this
// trait so tests can substitute a scripted double that records every call.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{Order, OrderKind, OrderSide, OrderStatus};

/// Order placement, cancellation, and direct status queries.
///
/// Live order-status events arrive separately, over the user-data stream fed
/// into the event bridge; `query_status` exists for the reconcile loop to
/// close stream gaps.
#[async_trait]
pub trait ExchangeGateway: Send + Sync + 'static {
    /// Place the conditional entry order (stop-market BUY).
    async fn place_entry(&self, symbol: &str, quantity: f64, trigger_price: f64)
        -> Result<Order>;

    /// Place one exit order (stop-loss or take-profit).
    async fn place_exit(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: OrderKind,
        quantity: f64,
        trigger_price: f64,
    ) -> Result<Order>;

    /// Cancel an order. Returns `Ok(false)` when the exchange refused the
    /// cancel without a transport error (e.g. the order is already terminal).
    async fn cancel(&self, symbol: &str, order_id: u64) -> Result<bool>;

    /// Query the current status of a single order.
    async fn query_status(&self, symbol: &str, order_id: u64) -> Result<OrderStatus>;
}
