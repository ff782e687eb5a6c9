// =============================================================================
// Order Status Event Bridge — per-order terminal-status notifications
// =============================================================================
//
// The user-data stream delivers one interleaved sequence of order events for
// the whole account. The bridge demultiplexes it: watchers subscribe by order
// id and receive exactly the FIRST terminal status reported for that order,
// over a oneshot channel. Non-terminal statuses are ignored.
//
// A bounded cache of recently delivered terminal statuses covers the window
// between the exchange acking a placement and the watcher subscribing: a
// subscriber that arrives after the terminal event still gets it immediately.
// The same cache absorbs duplicates replayed by the reconcile loop.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::types::{OrderStatus, OrderUpdate};

/// How many delivered terminal statuses to remember. Orders are bounded by
/// live trades (three per trade), so this comfortably covers any realistic
/// subscribe-after-delivery window.
const DELIVERED_CACHE_CAP: usize = 1024;

struct Waiter {
    symbol: String,
    senders: Vec<oneshot::Sender<OrderStatus>>,
}

/// Demultiplexes the shared order-event stream into per-order notifications.
pub struct OrderEventBridge {
    waiters: Mutex<HashMap<u64, Waiter>>,
    delivered: Mutex<DeliveredCache>,
}

struct DeliveredCache {
    map: HashMap<u64, OrderStatus>,
    insertion: VecDeque<u64>,
}

impl DeliveredCache {
    fn record(&mut self, order_id: u64, status: OrderStatus) {
        if self.map.insert(order_id, status).is_none() {
            self.insertion.push_back(order_id);
            if self.insertion.len() > DELIVERED_CACHE_CAP {
                if let Some(evicted) = self.insertion.pop_front() {
                    self.map.remove(&evicted);
                }
            }
        }
    }
}

impl OrderEventBridge {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            delivered: Mutex::new(DeliveredCache {
                map: HashMap::new(),
                insertion: VecDeque::new(),
            }),
        }
    }

    /// Register interest in `order_id`. The returned receiver resolves with
    /// the first terminal status observed for the order, immediately if one
    /// has already been delivered, or stays pending until one arrives.
    ///
    /// The symbol is kept alongside the registration so the reconcile loop
    /// can query pending orders directly.
    pub fn subscribe(&self, order_id: u64, symbol: &str) -> oneshot::Receiver<OrderStatus> {
        let (tx, rx) = oneshot::channel();

        // Lock order matches dispatch (delivered, then waiters) and the
        // delivered lock is held across the waiter insertion, so a dispatch
        // cannot slip between the cache check and the registration.
        let delivered = self.delivered.lock();
        if let Some(&status) = delivered.map.get(&order_id) {
            debug!(order_id, %status, "subscribe after terminal delivery — resolving immediately");
            let _ = tx.send(status);
            return rx;
        }

        let mut waiters = self.waiters.lock();
        waiters
            .entry(order_id)
            .or_insert_with(|| Waiter {
                symbol: symbol.to_string(),
                senders: Vec::new(),
            })
            .senders
            .push(tx);
        debug!(order_id, symbol, "subscribed to order events");
        rx
    }

    /// Feed one order-status event through the bridge.
    ///
    /// Non-terminal statuses are ignored. Only the first terminal status per
    /// order is delivered; later terminals (e.g. a reconcile replay) are
    /// dropped.
    pub fn dispatch(&self, update: OrderUpdate) {
        if !update.status.is_terminal() {
            debug!(order_id = update.order_id, status = %update.status, "non-terminal status ignored");
            return;
        }

        {
            let mut delivered = self.delivered.lock();
            if delivered.map.contains_key(&update.order_id) {
                debug!(
                    order_id = update.order_id,
                    status = %update.status,
                    "terminal status already delivered — dropping duplicate"
                );
                return;
            }
            delivered.record(update.order_id, update.status);
        }

        let waiter = self.waiters.lock().remove(&update.order_id);
        match waiter {
            Some(waiter) => {
                let count = waiter.senders.len();
                for tx in waiter.senders {
                    // A dropped receiver just means the watcher gave up.
                    let _ = tx.send(update.status);
                }
                info!(
                    order_id = update.order_id,
                    status = %update.status,
                    watchers = count,
                    "terminal status delivered"
                );
            }
            None => {
                debug!(
                    order_id = update.order_id,
                    status = %update.status,
                    "terminal status cached — no watcher yet"
                );
            }
        }
    }

    /// Snapshot of orders that still have watchers waiting, for the
    /// reconcile loop to query directly.
    pub fn pending(&self) -> Vec<(u64, String)> {
        self.waiters
            .lock()
            .iter()
            .map(|(&id, w)| (id, w.symbol.clone()))
            .collect()
    }

    /// Consume the raw event channel until the senders are all dropped.
    /// Stream reconnection is the feed's concern; the bridge just keeps
    /// consuming whatever arrives on the channel.
    pub async fn run(&self, mut rx: mpsc::Receiver<OrderUpdate>) {
        info!("order event bridge running");
        while let Some(update) = rx.recv().await {
            self.dispatch(update);
        }
        warn!("order event channel closed — bridge stopping");
    }
}

impl Default for OrderEventBridge {
    fn default() -> Self {
        Self::new()
    }
}
