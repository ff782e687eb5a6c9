// =============================================================================
// Entry Controller — place the conditional entry and wait for its fill
// =============================================================================
//
// Placement is retried up to `max_retries` times with a fixed delay; a signal
// whose entry order reaches any terminal status other than FILLED is stale
// and never retried.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::bridge::OrderEventBridge;
use crate::gateway::ExchangeGateway;
use crate::types::{Order, OrderStatus, Signal};

/// Why the entry phase ended without a filled order.
#[derive(Debug, Error)]
pub enum EntryFailure {
    /// Every placement attempt failed (network fault or API rejection).
    #[error("entry placement exhausted after {attempts} attempts")]
    PlacementExhausted { attempts: u32 },

    /// The exchange resolved the entry order to a terminal status other
    /// than FILLED. The signal is stale; no retry.
    #[error("entry order not filled: {0}")]
    NotFilled(OrderStatus),

    /// The configured fill wait elapsed; the order was cancelled.
    #[error("entry order fill wait timed out")]
    FillTimeout,

    /// The event bridge dropped our watcher (shutdown or internal fault).
    #[error("entry watch lost before a terminal status arrived")]
    WatchLost,
}

pub struct EntryController<G> {
    gateway: Arc<G>,
    bridge: Arc<OrderEventBridge>,
    max_retries: u32,
    retry_delay: Duration,
    /// `None` waits indefinitely for the fill.
    fill_timeout: Option<Duration>,
}

impl<G: ExchangeGateway> EntryController<G> {
    pub fn new(
        gateway: Arc<G>,
        bridge: Arc<OrderEventBridge>,
        max_retries: u32,
        retry_delay: Duration,
        fill_timeout: Option<Duration>,
    ) -> Self {
        Self {
            gateway,
            bridge,
            max_retries,
            retry_delay,
            fill_timeout,
        }
    }

    /// Get exactly one entry order live and resolve it to filled or failed.
    pub async fn open(&self, signal: &Signal, quantity: f64) -> Result<Order, EntryFailure> {
        let mut order = self.place_with_retry(signal, quantity).await?;

        info!(
            order_id = order.order_id,
            symbol = %order.symbol,
            trigger_price = order.trigger_price,
            quantity,
            "entry order placed — awaiting fill"
        );

        let rx = self.bridge.subscribe(order.order_id, &order.symbol);

        let status = match self.fill_timeout {
            None => rx.await.map_err(|_| EntryFailure::WatchLost)?,
            Some(limit) => match timeout(limit, rx).await {
                Ok(Ok(status)) => status,
                Ok(Err(_)) => return Err(EntryFailure::WatchLost),
                Err(_) => {
                    warn!(
                        order_id = order.order_id,
                        timeout_secs = limit.as_secs(),
                        "entry fill wait timed out — cancelling entry order"
                    );
                    match self.gateway.cancel(&order.symbol, order.order_id).await {
                        Ok(accepted) => info!(
                            order_id = order.order_id,
                            accepted, "timed-out entry cancel issued"
                        ),
                        Err(e) => warn!(
                            order_id = order.order_id,
                            error = %e,
                            "timed-out entry cancel failed"
                        ),
                    }
                    return Err(EntryFailure::FillTimeout);
                }
            },
        };

        match status {
            OrderStatus::Filled => {
                order.status = OrderStatus::Filled;
                info!(order_id = order.order_id, symbol = %order.symbol, "entry order filled");
                Ok(order)
            }
            other => {
                warn!(
                    order_id = order.order_id,
                    symbol = %order.symbol,
                    status = %other,
                    "entry order resolved without filling"
                );
                Err(EntryFailure::NotFilled(other))
            }
        }
    }

    /// Placement with bounded retry. Any placement error counts as one
    /// attempt; the delay is skipped after the final one.
    async fn place_with_retry(
        &self,
        signal: &Signal,
        quantity: f64,
    ) -> Result<Order, EntryFailure> {
        for attempt in 1..=self.max_retries {
            match self
                .gateway
                .place_entry(&signal.symbol, quantity, signal.entry_price)
                .await
            {
                Ok(order) => return Ok(order),
                Err(e) => {
                    warn!(
                        symbol = %signal.symbol,
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "entry placement attempt failed"
                    );
                    if attempt < self.max_retries {
                        sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(EntryFailure::PlacementExhausted {
            attempts: self.max_retries,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;
    use crate::types::OrderUpdate;

    fn signal() -> Signal {
        Signal {
            symbol: "BTCUSDT".into(),
            entry_price: 50000.0,
            stop_loss: 49000.0,
            take_profit: 52000.0,
        }
    }

    fn controller(
        gateway: Arc<MockGateway>,
        bridge: Arc<OrderEventBridge>,
        fill_timeout: Option<Duration>,
    ) -> EntryController<MockGateway> {
        EntryController::new(gateway, bridge, 3, Duration::from_millis(5), fill_timeout)
    }

    #[tokio::test]
    async fn open_returns_filled_order() {
        let gateway = Arc::new(MockGateway::new());
        let bridge = Arc::new(OrderEventBridge::new());
        let ctrl = controller(gateway.clone(), bridge.clone(), None);
        let entry_id = gateway.peek_next_id();

        let task = tokio::spawn({
            let sig = signal();
            async move { ctrl.open(&sig, 0.001).await }
        });

        // Fill arrives over the bridge; the delivered cache makes the order
        // of subscribe vs dispatch irrelevant.
        tokio::time::sleep(Duration::from_millis(20)).await;
        bridge.dispatch(OrderUpdate {
            order_id: entry_id,
            status: OrderStatus::Filled,
        });

        let order = task.await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.order_id, entry_id);
        assert_eq!(gateway.entry_calls.lock().len(), 1);
        let (sym, qty, price) = gateway.entry_calls.lock()[0].clone();
        assert_eq!(sym, "BTCUSDT");
        assert!((qty - 0.001).abs() < f64::EPSILON);
        assert!((price - 50000.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn exhausts_after_exactly_max_retries_attempts() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_entries(10); // more failures scripted than allowed attempts
        let bridge = Arc::new(OrderEventBridge::new());
        let ctrl = controller(gateway.clone(), bridge, None);

        let err = ctrl.open(&signal(), 0.001).await.unwrap_err();
        assert!(matches!(err, EntryFailure::PlacementExhausted { attempts: 3 }));
        // The placement primitive was called exactly max_retries times.
        assert_eq!(gateway.entry_calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_entries(2); // two failures, third attempt succeeds
        let bridge = Arc::new(OrderEventBridge::new());
        let ctrl = controller(gateway.clone(), bridge.clone(), None);
        let entry_id = gateway.peek_next_id();

        let task = tokio::spawn({
            let sig = signal();
            async move { ctrl.open(&sig, 0.001).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        bridge.dispatch(OrderUpdate {
            order_id: entry_id,
            status: OrderStatus::Filled,
        });

        assert!(task.await.unwrap().is_ok());
        assert_eq!(gateway.entry_calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn expired_entry_is_not_filled_and_not_retried() {
        let gateway = Arc::new(MockGateway::new());
        let bridge = Arc::new(OrderEventBridge::new());
        let ctrl = controller(gateway.clone(), bridge.clone(), None);
        let entry_id = gateway.peek_next_id();

        let task = tokio::spawn({
            let sig = signal();
            async move { ctrl.open(&sig, 0.001).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bridge.dispatch(OrderUpdate {
            order_id: entry_id,
            status: OrderStatus::Expired,
        });

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, EntryFailure::NotFilled(OrderStatus::Expired)));
        // One placement, no retry after the terminal rejection.
        assert_eq!(gateway.entry_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn fill_timeout_cancels_the_entry() {
        let gateway = Arc::new(MockGateway::new());
        let bridge = Arc::new(OrderEventBridge::new());
        let ctrl = controller(
            gateway.clone(),
            bridge,
            Some(Duration::from_millis(30)),
        );
        let entry_id = gateway.peek_next_id();

        // No fill ever arrives.
        let err = ctrl.open(&signal(), 0.001).await.unwrap_err();
        assert!(matches!(err, EntryFailure::FillTimeout));
        assert_eq!(
            gateway.cancel_calls.lock().as_slice(),
            &[("BTCUSDT".to_string(), entry_id)]
        );
    }
}
