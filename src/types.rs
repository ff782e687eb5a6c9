// =============================================================================
// Shared types used across the bracket trading engine
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Order primitives
// ---------------------------------------------------------------------------

/// Order side as Binance expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The three order types the engine places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    /// Conditional entry: opens the position once the trigger price trades.
    StopMarketEntry,
    /// Protective stop-loss on an open position.
    StopMarketExit,
    /// Take-profit leg of the exit pair.
    TakeProfitMarket,
}

impl OrderKind {
    /// Binance futures order-type string for this kind.
    pub fn binance_type(&self) -> &'static str {
        match self {
            Self::StopMarketEntry | Self::StopMarketExit => "STOP_MARKET",
            Self::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopMarketEntry => write!(f, "StopMarketEntry"),
            Self::StopMarketExit => write!(f, "StopMarketExit"),
            Self::TakeProfitMarket => write!(f, "TakeProfitMarket"),
        }
    }
}

/// Exchange-reported order status, validated at the gateway boundary.
///
/// Raw status strings never travel past the gateway: anything the exchange
/// reports is parsed into this closed set or rejected as a parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Parse a Binance status string. Unknown statuses are an error so that
    /// new exchange states surface loudly instead of being misclassified.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "NEW" => Ok(Self::New),
            "PARTIALLY_FILLED" => Ok(Self::PartiallyFilled),
            "FILLED" => Ok(Self::Filled),
            "CANCELED" => Ok(Self::Canceled),
            "REJECTED" => Ok(Self::Rejected),
            "EXPIRED" => Ok(Self::Expired),
            other => anyhow::bail!("unknown order status from exchange: {other}"),
        }
    }

    /// Terminal statuses admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "NEW"),
            Self::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Canceled => write!(f, "CANCELED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Handle to an exchange-side order. Status is only ever updated from
/// gateway-delivered events, never inferred locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub trigger_price: f64,
    pub quantity: f64,
    pub status: OrderStatus,
}

/// A single order-status event off the user-data stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderUpdate {
    pub order_id: u64,
    pub status: OrderStatus,
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// A validated trade signal from the ingestion collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

impl Signal {
    /// All three prices must be strictly positive.
    pub fn is_valid(&self) -> bool {
        !self.symbol.is_empty()
            && self.entry_price > 0.0
            && self.stop_loss > 0.0
            && self.take_profit > 0.0
    }
}

// ---------------------------------------------------------------------------
// Trades
// ---------------------------------------------------------------------------

/// Which leg of the exit pair won the race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitLeg {
    StopLoss,
    TakeProfit,
}

impl std::fmt::Display for ExitLeg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "StopLoss"),
            Self::TakeProfit => write!(f, "TakeProfit"),
        }
    }
}

/// Result of the exit race: which order reached a terminal status first,
/// and which status it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOutcome {
    pub winner: ExitLeg,
    pub status: OrderStatus,
}

/// Lifecycle state of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeState {
    AwaitingEntry,
    EntryFilled,
    AwaitingExits,
    ExitRace,
    Closed,
    Aborted,
}

impl TradeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Aborted)
    }
}

impl std::fmt::Display for TradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingEntry => write!(f, "AwaitingEntry"),
            Self::EntryFilled => write!(f, "EntryFilled"),
            Self::AwaitingExits => write!(f, "AwaitingExits"),
            Self::ExitRace => write!(f, "ExitRace"),
            Self::Closed => write!(f, "Closed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// One tracked trade: the entry order plus, once the entry fills, the two
/// exit orders. Owned exclusively by the lifecycle manager; snapshots handed
/// out elsewhere are clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Locally generated identity — assigned before the exchange responds.
    pub id: Uuid,
    pub symbol: String,
    pub quantity: f64,
    pub entry_order: Option<Order>,
    pub stop_loss_order: Option<Order>,
    pub take_profit_order: Option<Order>,
    pub state: TradeState,
    pub opened_at: String,
    #[serde(default)]
    pub closed_at: Option<String>,
    #[serde(default)]
    pub outcome: Option<ExitOutcome>,
    /// Why the trade aborted, when it did.
    #[serde(default)]
    pub abort_reason: Option<String>,
}

impl Trade {
    pub fn new(symbol: impl Into<String>, quantity: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            quantity,
            entry_order: None,
            stop_loss_order: None,
            take_profit_order: None,
            state: TradeState::AwaitingEntry,
            opened_at: Utc::now().to_rfc3339(),
            closed_at: None,
            outcome: None,
            abort_reason: None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_roundtrip() {
        for s in ["NEW", "PARTIALLY_FILLED", "FILLED", "CANCELED", "REJECTED", "EXPIRED"] {
            let parsed = OrderStatus::parse(s).unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn unknown_status_is_an_error() {
        assert!(OrderStatus::parse("PENDING_CANCEL").is_err());
        assert!(OrderStatus::parse("").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
    }

    #[test]
    fn order_kind_maps_to_binance_types() {
        assert_eq!(OrderKind::StopMarketEntry.binance_type(), "STOP_MARKET");
        assert_eq!(OrderKind::StopMarketExit.binance_type(), "STOP_MARKET");
        assert_eq!(OrderKind::TakeProfitMarket.binance_type(), "TAKE_PROFIT_MARKET");
    }

    #[test]
    fn signal_validation() {
        let good = Signal {
            symbol: "BTCUSDT".into(),
            entry_price: 50000.0,
            stop_loss: 49000.0,
            take_profit: 52000.0,
        };
        assert!(good.is_valid());

        let bad = Signal { stop_loss: 0.0, ..good.clone() };
        assert!(!bad.is_valid());
        let bad = Signal { symbol: String::new(), ..good };
        assert!(!bad.is_valid());
    }

    #[test]
    fn new_trade_starts_awaiting_entry() {
        let t = Trade::new("BTCUSDT", 0.001);
        assert_eq!(t.state, TradeState::AwaitingEntry);
        assert!(t.entry_order.is_none());
        assert!(t.stop_loss_order.is_none());
        assert!(t.take_profit_order.is_none());
        assert!(!t.state.is_terminal());
    }
}
