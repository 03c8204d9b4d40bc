// =============================================================================
// Core data model — Tick, Candle, Order, Subscription, SessionPnl
// =============================================================================
//
// Every value that crosses a component boundary is a tagged record with a
// statically known field set, per the "dynamic hashes as records" guidance:
// no JSON blob stands in for a domain type once it is inside the runtime.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::Money;

/// Broker segment identifier (e.g. index segment, option segment). Treated
/// as an opaque configured string rather than a closed enum, matching
/// `SYMBOLS.<sym>.{seg_idx,seg_opt}` in configuration.
pub type Segment = String;

/// Broker-assigned instrument id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SecurityId(pub i64);

impl std::fmt::Display for SecurityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Option right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Right {
    #[serde(rename = "C")]
    Call,
    #[serde(rename = "P")]
    Put,
}

impl std::fmt::Display for Right {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Right::Call => write!(f, "C"),
            Right::Put => write!(f, "P"),
        }
    }
}

/// Order / position side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Trend direction reported by the indicator engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Bullish,
    Bearish,
    None,
}

impl Direction {
    /// Translate a trend direction to the option right an entry would buy.
    pub fn to_right(self) -> Option<Right> {
        match self {
            Direction::Bullish => Some(Right::Call),
            Direction::Bearish => Some(Right::Put),
            Direction::None => None,
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Bullish => Direction::Bearish,
            Direction::Bearish => Direction::Bullish,
            Direction::None => Direction::None,
        }
    }
}

/// A single streamed tick. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub segment: Segment,
    pub security_id: SecurityId,
    pub ltp: Money,
    pub atp: Money,
    pub day_high: Money,
    pub day_low: Money,
    pub volume: u64,
    /// Timestamp assigned by the exchange/broker feed.
    pub server_timestamp: i64,
    /// Wall-clock time this process observed the tick.
    pub received_at: DateTime<Utc>,
}

/// A single OHLCV candle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

/// Composite key identifying one candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// Ordered, append-only OHLCV sequence at one interval for one instrument.
/// Reseeded from a historical fetch on startup (out of scope: the fetch
/// itself is an external collaborator; this crate only needs the seeded
/// series).
#[derive(Debug, Clone, Default)]
pub struct CandleSeries {
    pub candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Rejected,
}

/// Paper vs. live execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Paper,
    Live,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Paper => write!(f, "paper"),
            Mode::Live => write!(f, "live"),
        }
    }
}

/// An append-only order record. Never mutated once `status` reaches a
/// terminal state (`filled`, `cancelled`, `rejected`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub security_id: SecurityId,
    pub segment: Segment,
    pub side: Side,
    pub quantity: i64,
    pub filled_quantity: i64,
    pub price: Money,
    pub filled_price: Money,
    pub fee: Money,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    pub session_id: String,
    pub mode: Mode,
}

impl Order {
    pub fn new_pending(
        security_id: SecurityId,
        segment: Segment,
        side: Side,
        quantity: i64,
        price: Money,
        fee: Money,
        session_id: impl Into<String>,
        mode: Mode,
    ) -> Self {
        Self {
            order_id: Uuid::new_v4().to_string(),
            security_id,
            segment,
            side,
            quantity,
            filled_quantity: 0,
            price,
            filled_price: Money::zero(),
            fee,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
            filled_at: None,
            session_id: session_id.into(),
            mode,
        }
    }
}

/// Subscription kind tracked by `WSManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionKind {
    /// Sticky for the whole session (index instruments, etc).
    Baseline,
    /// Added when a position opens, removed only when it fully closes.
    Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub segment: Segment,
    pub security_id: SecurityId,
}

/// Running session profit-and-loss ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPnl {
    pub realized: Money,
    pub unrealized: Money,
    pub fees: Money,
    pub total: Money,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub max_drawdown: Money,
    pub current_positions: u32,
}

impl SessionPnl {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            realized: Money::zero(),
            unrealized: Money::zero(),
            fees: Money::zero(),
            total: Money::zero(),
            start_time: now,
            last_update: now,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            max_drawdown: Money::zero(),
            current_positions: 0,
        }
    }
}

impl Default for SessionPnl {
    fn default() -> Self {
        Self::new()
    }
}

/// Tabular end-of-session report artifact (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_secs: i64,
    pub total_trades: u32,
    pub winning: u32,
    pub losing: u32,
    pub win_rate: f64,
    pub total_pnl: Money,
    pub max_profit: Money,
    pub max_drawdown: Money,
    pub starting_balance: Money,
    pub final_balance: Money,
    pub failures_by_kind: std::collections::HashMap<String, u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_to_right_maps_correctly() {
        assert_eq!(Direction::Bullish.to_right(), Some(Right::Call));
        assert_eq!(Direction::Bearish.to_right(), Some(Right::Put));
        assert_eq!(Direction::None.to_right(), None);
    }

    #[test]
    fn direction_opposite_is_involutive() {
        assert_eq!(Direction::Bullish.opposite(), Direction::Bearish);
        assert_eq!(Direction::Bearish.opposite().opposite(), Direction::Bearish);
        assert_eq!(Direction::None.opposite(), Direction::None);
    }

    #[test]
    fn candle_series_closes_preserve_order() {
        let series = CandleSeries {
            candles: vec![
                Candle { open_time: 0, close_time: 1, open: 1.0, high: 1.0, low: 1.0, close: 10.0, volume: 1.0, is_closed: true },
                Candle { open_time: 1, close_time: 2, open: 1.0, high: 1.0, low: 1.0, close: 20.0, volume: 1.0, is_closed: true },
            ],
        };
        assert_eq!(series.closes(), vec![10.0, 20.0]);
    }

    #[test]
    fn new_order_starts_pending_with_no_fill() {
        let order = Order::new_pending(
            SecurityId(1),
            "NSE_FO".to_string(),
            Side::Buy,
            75,
            Money::zero(),
            Money::zero(),
            "sess-1",
            Mode::Paper,
        );
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.filled_quantity, 0);
        assert!(order.filled_at.is_none());
    }
}
