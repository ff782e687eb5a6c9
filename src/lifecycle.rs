// =============================================================================
// Trade Lifecycle Manager — owns the live-trade table and drives each trade
// =============================================================================
//
// Transition table:
//
//   AwaitingEntry --entry filled--------------> EntryFilled
//   AwaitingEntry --not filled / exhausted----> Aborted
//   EntryFilled   --placing exit pair---------> AwaitingExits
//   AwaitingExits --both exits placed---------> ExitRace
//   AwaitingExits --exit placement failure----> Aborted
//   ExitRace      --one terminal, other
//                   cancelled-----------------> Closed
//   *             --unexpected internal fault-> Aborted
//
// Closed and Aborted are terminal: the trade leaves the live table and moves
// to the finished history. Each trade is driven by a single spawned task, so
// per-trade mutation is single-writer; the table itself is shared behind a
// parking_lot RwLock.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bridge::OrderEventBridge;
use crate::config::Config;
use crate::entry::EntryController;
use crate::exits::ExitRaceMonitor;
use crate::gateway::ExchangeGateway;
use crate::types::{ExitOutcome, Signal, Trade, TradeState};

pub struct TradeLifecycleManager<G> {
    gateway: Arc<G>,
    bridge: Arc<OrderEventBridge>,
    config: Config,
    /// Live trades only. Terminal trades move to `finished`.
    trades: RwLock<HashMap<Uuid, Trade>>,
    finished: RwLock<Vec<Trade>>,
}

impl<G: ExchangeGateway> TradeLifecycleManager<G> {
    pub fn new(gateway: Arc<G>, bridge: Arc<OrderEventBridge>, config: Config) -> Self {
        Self {
            gateway,
            bridge,
            config,
            trades: RwLock::new(HashMap::new()),
            finished: RwLock::new(Vec::new()),
        }
    }

    /// Consume validated signals off the ingestion channel until the sender
    /// side is dropped. Each accepted signal runs as its own task; new
    /// signals never wait on prior trades.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<Signal>) {
        info!("trade lifecycle manager running");
        while let Some(signal) = rx.recv().await {
            self.clone().accept_signal(signal);
        }
        warn!("signal channel closed — lifecycle manager stopping");
    }

    /// Accept one signal: create the trade, insert it into the live table,
    /// and spawn the task that drives it to a terminal state. Returns the
    /// trade id, or `None` when the signal fails validation.
    pub fn accept_signal(self: Arc<Self>, signal: Signal) -> Option<Uuid> {
        if !signal.is_valid() {
            warn!(?signal, "rejecting invalid signal");
            return None;
        }

        let trade = Trade::new(&signal.symbol, self.config.order_quantity);
        let trade_id = trade.id;

        info!(
            trade_id = %trade_id,
            symbol = %signal.symbol,
            entry_price = signal.entry_price,
            stop_loss = signal.stop_loss,
            take_profit = signal.take_profit,
            quantity = trade.quantity,
            "signal accepted — trade created"
        );

        self.trades.write().insert(trade_id, trade);

        tokio::spawn(async move {
            self.drive(trade_id, signal).await;
        });

        Some(trade_id)
    }

    // -------------------------------------------------------------------------
    // Per-trade drive task
    // -------------------------------------------------------------------------

    async fn drive(self: Arc<Self>, trade_id: Uuid, signal: Signal) {
        let quantity = self.config.order_quantity;

        // ── Entry ────────────────────────────────────────────────────────
        let entry = EntryController::new(
            self.gateway.clone(),
            self.bridge.clone(),
            self.config.max_retries,
            self.config.retry_delay(),
            self.config.entry_fill_timeout(),
        );

        let entry_order = match entry.open(&signal, quantity).await {
            Ok(order) => order,
            Err(e) => {
                self.abort(trade_id, format!("entry failed: {e}"));
                return;
            }
        };

        self.transition(trade_id, TradeState::EntryFilled, |t| {
            t.entry_order = Some(entry_order.clone());
        });

        // ── Exit pair placement ──────────────────────────────────────────
        self.transition(trade_id, TradeState::AwaitingExits, |_| {});

        let exits = ExitRaceMonitor::new(self.gateway.clone(), self.bridge.clone());

        let (sl_order, tp_order) = match exits
            .place_exits(&signal.symbol, quantity, signal.stop_loss, signal.take_profit)
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                self.abort(trade_id, format!("exit placement failed: {e}"));
                return;
            }
        };

        self.transition(trade_id, TradeState::ExitRace, |t| {
            t.stop_loss_order = Some(sl_order.clone());
            t.take_profit_order = Some(tp_order.clone());
        });

        // ── Race ─────────────────────────────────────────────────────────
        match exits.race(&sl_order, &tp_order).await {
            Ok(outcome) => self.close(trade_id, outcome),
            Err(e) => self.abort(trade_id, format!("exit race failed: {e}")),
        }
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// Apply a non-terminal transition under the table lock.
    fn transition(
        &self,
        trade_id: Uuid,
        to: TradeState,
        apply: impl FnOnce(&mut Trade),
    ) {
        let mut trades = self.trades.write();
        match trades.get_mut(&trade_id) {
            Some(trade) if trade.state.is_terminal() => {
                // Terminal states admit no further transition.
                error!(
                    trade_id = %trade_id,
                    state = %trade.state,
                    attempted = %to,
                    "transition attempted out of a terminal state — ignored"
                );
            }
            Some(trade) => {
                let from = trade.state;
                trade.state = to;
                apply(trade);
                info!(trade_id = %trade_id, %from, %to, "trade state transition");
            }
            None => {
                error!(trade_id = %trade_id, attempted = %to, "transition for unknown trade");
            }
        }
    }

    /// Terminal transition to Closed: record the race outcome and retire the
    /// trade from the live table.
    fn close(&self, trade_id: Uuid, outcome: ExitOutcome) {
        self.finish(trade_id, TradeState::Closed, |t| {
            t.outcome = Some(outcome);
            if let Some(order) = match outcome.winner {
                crate::types::ExitLeg::StopLoss => t.stop_loss_order.as_mut(),
                crate::types::ExitLeg::TakeProfit => t.take_profit_order.as_mut(),
            } {
                order.status = outcome.status;
            }
        });
        info!(
            trade_id = %trade_id,
            winner = %outcome.winner,
            status = %outcome.status,
            "trade closed"
        );
    }

    /// Terminal transition to Aborted.
    fn abort(&self, trade_id: Uuid, reason: String) {
        warn!(trade_id = %trade_id, reason = %reason, "trade aborted");
        self.finish(trade_id, TradeState::Aborted, |t| {
            t.abort_reason = Some(reason);
        });
    }

    fn finish(&self, trade_id: Uuid, state: TradeState, apply: impl FnOnce(&mut Trade)) {
        let removed = self.trades.write().remove(&trade_id);
        match removed {
            Some(mut trade) => {
                trade.state = state;
                trade.closed_at = Some(Utc::now().to_rfc3339());
                apply(&mut trade);
                self.finished.write().push(trade);
            }
            None => {
                error!(trade_id = %trade_id, "finish called for a trade not in the live table");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Cloned snapshot of all live trades.
    pub fn active_trades(&self) -> Vec<Trade> {
        self.trades.read().values().cloned().collect()
    }

    /// The most recent `count` finished trades, newest first.
    pub fn finished_trades(&self, count: usize) -> Vec<Trade> {
        let finished = self.finished.read();
        finished.iter().rev().take(count).cloned().collect()
    }
}

impl<G> std::fmt::Debug for TradeLifecycleManager<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeLifecycleManager")
            .field("live_trades", &self.trades.read().len())
            .field("finished_trades", &self.finished.read().len())
            .finish()
    }
}
