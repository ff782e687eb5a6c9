// =============================================================================
// Exit Race Monitor — the one-cancels-other pair on a filled entry
// =============================================================================
//
// Once the entry fills, the stop-loss and take-profit are placed together and
// watched concurrently. The first to reach ANY terminal status wins the race;
// the loser is sent exactly one cancellation request. Cancelling an order
// that already went terminal is expected to fail on the exchange side and is
// swallowed.
//
// A half-open pair (one leg placed, the other refused) is fatal for the
// trade: the placed leg gets a best-effort cancel, the failure propagates.
// =============================================================================

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bridge::OrderEventBridge;
use crate::gateway::ExchangeGateway;
use crate::types::{ExitLeg, ExitOutcome, Order, OrderKind, OrderSide};

/// Why the exit phase could not complete.
#[derive(Debug, Error)]
pub enum ExitFailure {
    #[error("stop-loss placement failed: {0}")]
    StopLossPlacement(#[source] anyhow::Error),

    #[error("take-profit placement failed: {0}")]
    TakeProfitPlacement(#[source] anyhow::Error),

    /// A watcher channel dropped before either order went terminal.
    #[error("exit watch lost before the race resolved")]
    WatchLost,
}

pub struct ExitRaceMonitor<G> {
    gateway: Arc<G>,
    bridge: Arc<OrderEventBridge>,
}

impl<G: ExchangeGateway> ExitRaceMonitor<G> {
    pub fn new(gateway: Arc<G>, bridge: Arc<OrderEventBridge>) -> Self {
        Self { gateway, bridge }
    }

    /// Place the stop-loss and take-profit pair for a filled long entry
    /// (both legs SELL, same quantity).
    ///
    /// If the take-profit placement fails after the stop-loss went live, the
    /// stop-loss receives one best-effort cancellation so no lone order is
    /// left on the book; its outcome is logged and never re-raised.
    pub async fn place_exits(
        &self,
        symbol: &str,
        quantity: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Result<(Order, Order), ExitFailure> {
        let sl_order = self
            .gateway
            .place_exit(
                symbol,
                OrderSide::Sell,
                OrderKind::StopMarketExit,
                quantity,
                stop_loss,
            )
            .await
            .map_err(ExitFailure::StopLossPlacement)?;

        info!(
            order_id = sl_order.order_id,
            symbol,
            trigger_price = stop_loss,
            "stop-loss order placed"
        );

        let tp_order = match self
            .gateway
            .place_exit(
                symbol,
                OrderSide::Sell,
                OrderKind::TakeProfitMarket,
                quantity,
                take_profit,
            )
            .await
        {
            Ok(order) => order,
            Err(e) => {
                warn!(
                    symbol,
                    sl_order_id = sl_order.order_id,
                    error = %e,
                    "take-profit placement failed — cancelling lone stop-loss"
                );
                match self.gateway.cancel(symbol, sl_order.order_id).await {
                    Ok(accepted) => info!(
                        order_id = sl_order.order_id,
                        accepted, "lone stop-loss cancel issued"
                    ),
                    Err(cancel_err) => warn!(
                        order_id = sl_order.order_id,
                        error = %cancel_err,
                        "lone stop-loss cancel failed — manual intervention may be needed"
                    ),
                }
                return Err(ExitFailure::TakeProfitPlacement(e));
            }
        };

        info!(
            order_id = tp_order.order_id,
            symbol,
            trigger_price = take_profit,
            "take-profit order placed"
        );

        Ok((sl_order, tp_order))
    }

    /// Watch both exit orders until the first reaches a terminal status,
    /// then cancel the other. The tie-break when both resolve in the same
    /// quantum is whichever branch the select polls first; either way
    /// exactly one cancellation request goes out.
    pub async fn race(&self, sl: &Order, tp: &Order) -> Result<ExitOutcome, ExitFailure> {
        let sl_rx = self.bridge.subscribe(sl.order_id, &sl.symbol);
        let tp_rx = self.bridge.subscribe(tp.order_id, &tp.symbol);

        info!(
            sl_order_id = sl.order_id,
            tp_order_id = tp.order_id,
            symbol = %sl.symbol,
            "exit race started"
        );

        let (outcome, loser_id) = tokio::select! {
            status = sl_rx => {
                let status = status.map_err(|_| ExitFailure::WatchLost)?;
                (ExitOutcome { winner: ExitLeg::StopLoss, status }, tp.order_id)
            }
            status = tp_rx => {
                let status = status.map_err(|_| ExitFailure::WatchLost)?;
                (ExitOutcome { winner: ExitLeg::TakeProfit, status }, sl.order_id)
            }
        };

        info!(
            winner = %outcome.winner,
            status = %outcome.status,
            loser_order_id = loser_id,
            "exit race resolved — cancelling loser"
        );

        // The loser may itself already be terminal; the cancel is issued
        // regardless and a refusal is harmless.
        match self.gateway.cancel(&sl.symbol, loser_id).await {
            Ok(true) => info!(order_id = loser_id, "loser exit order cancelled"),
            Ok(false) => debug!(
                order_id = loser_id,
                "loser cancel refused — order already terminal"
            ),
            Err(e) => debug!(
                order_id = loser_id,
                error = %e,
                "loser cancel errored — order likely already terminal"
            ),
        }

        Ok(outcome)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::{MockGateway, Scripted};
    use crate::types::{OrderStatus, OrderUpdate};
    use std::time::Duration;

    fn monitor(
        gateway: &Arc<MockGateway>,
        bridge: &Arc<OrderEventBridge>,
    ) -> ExitRaceMonitor<MockGateway> {
        ExitRaceMonitor::new(gateway.clone(), bridge.clone())
    }

    #[tokio::test]
    async fn places_both_exits_with_correct_legs() {
        let gateway = Arc::new(MockGateway::new());
        let bridge = Arc::new(OrderEventBridge::new());
        let m = monitor(&gateway, &bridge);

        let (sl, tp) = m
            .place_exits("BTCUSDT", 0.001, 49000.0, 52000.0)
            .await
            .unwrap();

        assert_eq!(sl.kind, OrderKind::StopMarketExit);
        assert_eq!(tp.kind, OrderKind::TakeProfitMarket);

        let calls = gateway.exit_calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].side, OrderSide::Sell);
        assert_eq!(calls[1].side, OrderSide::Sell);
        assert!((calls[0].trigger_price - 49000.0).abs() < f64::EPSILON);
        assert!((calls[1].trigger_price - 52000.0).abs() < f64::EPSILON);
        assert!((calls[0].quantity - 0.001).abs() < f64::EPSILON);
        assert!((calls[1].quantity - 0.001).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn take_profit_failure_cancels_lone_stop_loss() {
        let gateway = Arc::new(MockGateway::new());
        gateway.script_exits(vec![
            Scripted::Ok,
            Scripted::Err("insufficient margin".into()),
        ]);
        let bridge = Arc::new(OrderEventBridge::new());
        let m = monitor(&gateway, &bridge);
        let sl_id = gateway.peek_next_id();

        let err = m
            .place_exits("BTCUSDT", 0.001, 49000.0, 52000.0)
            .await
            .unwrap_err();

        assert!(matches!(err, ExitFailure::TakeProfitPlacement(_)));
        // Exactly one cancellation attempt, for the stop-loss that did place.
        assert_eq!(
            gateway.cancel_calls.lock().as_slice(),
            &[("BTCUSDT".to_string(), sl_id)]
        );
    }

    #[tokio::test]
    async fn stop_loss_failure_places_nothing_else() {
        let gateway = Arc::new(MockGateway::new());
        gateway.script_exits(vec![Scripted::Err("rejected".into())]);
        let bridge = Arc::new(OrderEventBridge::new());
        let m = monitor(&gateway, &bridge);

        let err = m
            .place_exits("BTCUSDT", 0.001, 49000.0, 52000.0)
            .await
            .unwrap_err();

        assert!(matches!(err, ExitFailure::StopLossPlacement(_)));
        assert_eq!(gateway.exit_calls.lock().len(), 1);
        assert!(gateway.cancel_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn stop_loss_fill_wins_and_cancels_take_profit() {
        let gateway = Arc::new(MockGateway::new());
        let bridge = Arc::new(OrderEventBridge::new());
        let m = monitor(&gateway, &bridge);

        let (sl, tp) = m
            .place_exits("BTCUSDT", 0.001, 49000.0, 52000.0)
            .await
            .unwrap();
        let sl_id = sl.order_id;
        let tp_id = tp.order_id;

        let race = tokio::spawn(async move { m.race(&sl, &tp).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bridge.dispatch(OrderUpdate {
            order_id: sl_id,
            status: OrderStatus::Filled,
        });

        let outcome = race.await.unwrap().unwrap();
        assert_eq!(outcome.winner, ExitLeg::StopLoss);
        assert_eq!(outcome.status, OrderStatus::Filled);
        // Take-profit received exactly one cancellation request.
        assert_eq!(
            gateway.cancel_calls.lock().as_slice(),
            &[("BTCUSDT".to_string(), tp_id)]
        );
    }

    #[tokio::test]
    async fn take_profit_terminal_wins_even_when_not_filled() {
        // CANCELED / REJECTED / EXPIRED still end the race.
        let gateway = Arc::new(MockGateway::new());
        let bridge = Arc::new(OrderEventBridge::new());
        let m = monitor(&gateway, &bridge);

        let (sl, tp) = m
            .place_exits("BTCUSDT", 0.001, 49000.0, 52000.0)
            .await
            .unwrap();
        let sl_id = sl.order_id;
        let tp_id = tp.order_id;

        let race = tokio::spawn(async move { m.race(&sl, &tp).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bridge.dispatch(OrderUpdate {
            order_id: tp_id,
            status: OrderStatus::Rejected,
        });

        let outcome = race.await.unwrap().unwrap();
        assert_eq!(outcome.winner, ExitLeg::TakeProfit);
        assert_eq!(outcome.status, OrderStatus::Rejected);
        assert_eq!(
            gateway.cancel_calls.lock().as_slice(),
            &[("BTCUSDT".to_string(), sl_id)]
        );
    }

    #[tokio::test]
    async fn refused_loser_cancel_is_harmless() {
        let gateway = Arc::new(MockGateway::new());
        *gateway.refuse_cancels.lock() = true;
        let bridge = Arc::new(OrderEventBridge::new());
        let m = monitor(&gateway, &bridge);

        let (sl, tp) = m
            .place_exits("BTCUSDT", 0.001, 49000.0, 52000.0)
            .await
            .unwrap();
        let sl_id = sl.order_id;

        let race = tokio::spawn(async move { m.race(&sl, &tp).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bridge.dispatch(OrderUpdate {
            order_id: sl_id,
            status: OrderStatus::Filled,
        });

        // The refused cancel does not surface as an error.
        let outcome = race.await.unwrap().unwrap();
        assert_eq!(outcome.winner, ExitLeg::StopLoss);
        assert_eq!(gateway.cancel_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn both_terminal_still_leaves_exactly_one_cancel() {
        // Both legs go terminal in the same quantum; whoever wins, exactly
        // one cancellation goes out (tie-break order unspecified).
        let gateway = Arc::new(MockGateway::new());
        let bridge = Arc::new(OrderEventBridge::new());
        let m = monitor(&gateway, &bridge);

        let (sl, tp) = m
            .place_exits("BTCUSDT", 0.001, 49000.0, 52000.0)
            .await
            .unwrap();
        let sl_id = sl.order_id;
        let tp_id = tp.order_id;

        bridge.dispatch(OrderUpdate { order_id: sl_id, status: OrderStatus::Filled });
        bridge.dispatch(OrderUpdate { order_id: tp_id, status: OrderStatus::Canceled });

        let outcome = m.race(&sl, &tp).await.unwrap();
        assert!(outcome.status.is_terminal());
        assert_eq!(gateway.cancel_calls.lock().len(), 1);
    }
}
