// =============================================================================
// Reconciliation — direct order-status queries for pending watchers
// =============================================================================
//
// The user-data stream can drop events while it reconnects. Watchers that
// registered before the gap would wait forever on a terminal status that was
// reported into the void. This loop periodically takes the bridge's pending
// subscriptions, queries each order directly over REST, and dispatches any
// terminal status it finds — the bridge's first-terminal-only rule makes the
// replay idempotent.
//
// SAFETY POLICY: reconciliation only observes and dispatches. It never
// cancels orders or mutates exchange state.
// =============================================================================

use std::sync::Arc;

use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::bridge::OrderEventBridge;
use crate::gateway::ExchangeGateway;
use crate::types::OrderUpdate;

/// Run one reconciliation pass: query every pending order and dispatch any
/// terminal status found. Returns how many terminal statuses were dispatched.
pub async fn reconcile_once<G: ExchangeGateway>(
    gateway: &G,
    bridge: &OrderEventBridge,
) -> usize {
    let pending = bridge.pending();
    if pending.is_empty() {
        debug!("reconcile: no pending order watchers");
        return 0;
    }

    debug!(count = pending.len(), "reconcile: querying pending orders");
    let mut dispatched = 0;

    for (order_id, symbol) in pending {
        match gateway.query_status(&symbol, order_id).await {
            Ok(status) if status.is_terminal() => {
                info!(
                    order_id,
                    symbol = %symbol,
                    %status,
                    "reconcile found terminal status missed by the stream"
                );
                bridge.dispatch(OrderUpdate { order_id, status });
                dispatched += 1;
            }
            Ok(status) => {
                debug!(order_id, symbol = %symbol, %status, "reconcile: order still live");
            }
            Err(e) => {
                // Query failures are logged and retried on the next pass.
                warn!(order_id, symbol = %symbol, error = %e, "reconcile query failed");
            }
        }
    }

    dispatched
}

/// Run the reconcile loop forever. Spawned once at startup.
pub async fn run_reconcile_loop<G: ExchangeGateway>(
    gateway: Arc<G>,
    bridge: Arc<OrderEventBridge>,
    every: Duration,
) {
    info!(interval_secs = every.as_secs(), "reconcile loop started");
    let mut ticker = interval(every);
    // The first tick fires immediately; skip it so a fresh subscription is
    // not queried before the exchange even acked the placement.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        reconcile_once(gateway.as_ref(), bridge.as_ref()).await;
    }
}
