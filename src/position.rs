// =============================================================================
// PositionTracker — authoritative per-instrument position state
// =============================================================================
//
// Generalizes the teacher's `position_engine::PositionManager` (one global
// `RwLock<Vec<Position>>` for every open position) to the full field set in
// the data model and to per-key reentrancy: mutations on different
// `(segment, security_id, side)` keys never contend, matching spec §5's
// "per-(segment, id, side) mutex; no global lock on reads".
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::money::Money;
use crate::types::{SecurityId, Segment, Side};

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct PositionKey {
    pub segment: Segment,
    pub security_id: SecurityId,
    pub side: Side,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub segment: Segment,
    pub security_id: SecurityId,
    pub side: Side,
    pub buy_qty: i64,
    pub buy_avg: Money,
    pub sell_qty: i64,
    pub sell_avg: Money,
    pub day_buy_qty: i64,
    pub day_sell_qty: i64,
    pub net_qty: i64,
    pub realized_pnl: Money,
    pub unrealized_pnl: Money,
    pub current_price: Money,
    pub entry_timestamp: DateTime<Utc>,
    pub peak_price: Money,
    pub stop_loss: Money,
    pub take_profit: Money,
    pub trailing_stop: Option<Money>,
    pub breakeven_locked: bool,
}

impl Position {
    fn new(segment: Segment, security_id: SecurityId, side: Side) -> Self {
        Self {
            position_id: uuid::Uuid::new_v4().to_string(),
            segment,
            security_id,
            side,
            buy_qty: 0,
            buy_avg: Money::zero(),
            sell_qty: 0,
            sell_avg: Money::zero(),
            day_buy_qty: 0,
            day_sell_qty: 0,
            net_qty: 0,
            realized_pnl: Money::zero(),
            unrealized_pnl: Money::zero(),
            current_price: Money::zero(),
            entry_timestamp: Utc::now(),
            peak_price: Money::zero(),
            stop_loss: Money::zero(),
            take_profit: Money::zero(),
            trailing_stop: None,
            breakeven_locked: false,
        }
    }
}

pub struct PartialExitResult {
    pub realized_pnl: Money,
    pub net_proceeds: Money,
}

/// Per-key mutex guarding a position's mutations. Reads (`get`, `list_open`)
/// take a point-in-time clone and never block on the mutex.
struct Slot {
    lock: Mutex<()>,
    position: parking_lot::RwLock<Position>,
}

pub struct PositionTracker {
    positions: DashMap<PositionKey, Arc<Slot>>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self {
            positions: DashMap::new(),
        }
    }

    fn slot(&self, key: &PositionKey) -> Arc<Slot> {
        self.positions
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Slot {
                    lock: Mutex::new(()),
                    position: parking_lot::RwLock::new(Position::new(
                        key.segment.clone(),
                        key.security_id,
                        key.side,
                    )),
                })
            })
            .clone()
    }

    /// Record a fill. `side` is the position's directional key (entries are
    /// always buys in this engine's domain; `add_fill` models the generic
    /// buy-side weighted-average accumulation from spec §3/§4.5).
    pub fn add_fill(
        &self,
        segment: Segment,
        security_id: SecurityId,
        side: Side,
        qty: i64,
        price: Money,
        _fee: Money,
    ) {
        let key = PositionKey { segment, security_id, side };
        let slot = self.slot(&key);
        let _guard = slot.lock.lock();
        let mut pos = slot.position.write();

        let new_buy_qty = pos.buy_qty + qty;
        let weighted = pos
            .buy_avg
            .mul_scalar(Decimal::from(pos.buy_qty))
            .unwrap()
            .add(price.mul_scalar(Decimal::from(qty)).unwrap())
            .unwrap();
        pos.buy_avg = weighted.checked_div(Decimal::from(new_buy_qty)).unwrap();
        pos.buy_qty = new_buy_qty;
        pos.day_buy_qty += qty;
        pos.net_qty = pos.buy_qty - pos.sell_qty;

        if pos.peak_price.is_zero() || price > pos.peak_price {
            pos.peak_price = price;
        }
        pos.current_price = price;
        if pos.buy_qty == qty {
            // First fill for this key.
            pos.entry_timestamp = Utc::now();
        }
    }

    /// Read-only preview of an exit's realized P&L / net proceeds, computed
    /// with the same formula `partial_exit` commits. Lets a caller credit
    /// balance before mutating the position, per spec §5's acquire order,
    /// without holding the position lock across an `.await`.
    pub fn preview_exit(
        &self,
        segment: Segment,
        security_id: SecurityId,
        side: Side,
        qty: i64,
        price: Money,
        fee: Money,
    ) -> Result<PartialExitResult, crate::error::TradeError> {
        let key = PositionKey { segment, security_id, side };
        let slot = self.slot(&key);
        let pos = slot.position.read();

        if pos.net_qty < qty {
            return Err(crate::error::TradeError::InsufficientPosition);
        }

        let realized_delta = price
            .sub(pos.buy_avg)
            .unwrap()
            .mul_scalar(Decimal::from(qty))
            .unwrap();
        let proceeds = price.mul_scalar(Decimal::from(qty)).unwrap().sub(fee).unwrap();

        Ok(PartialExitResult {
            realized_pnl: realized_delta,
            net_proceeds: proceeds,
        })
    }

    /// Sell `qty` at `price` against an existing long. Returns the realized
    /// P&L delta for this exit; `buy_avg` is left unchanged (spec §3).
    pub fn partial_exit(
        &self,
        segment: Segment,
        security_id: SecurityId,
        side: Side,
        qty: i64,
        price: Money,
        fee: Money,
    ) -> Result<PartialExitResult, crate::error::TradeError> {
        let key = PositionKey { segment, security_id, side };
        let slot = self.slot(&key);
        let _guard = slot.lock.lock();
        let mut pos = slot.position.write();

        if pos.net_qty < qty {
            return Err(crate::error::TradeError::InsufficientPosition);
        }

        let realized_delta = price
            .sub(pos.buy_avg)
            .unwrap()
            .mul_scalar(Decimal::from(qty))
            .unwrap();
        let proceeds = price.mul_scalar(Decimal::from(qty)).unwrap().sub(fee).unwrap();

        pos.realized_pnl = pos.realized_pnl.add(realized_delta).unwrap();
        pos.sell_qty += qty;
        pos.day_sell_qty += qty;
        pos.net_qty = pos.buy_qty - pos.sell_qty;
        pos.current_price = price;

        if pos.net_qty == 0 {
            pos.peak_price = Money::zero();
        }

        Ok(PartialExitResult {
            realized_pnl: realized_delta,
            net_proceeds: proceeds,
        })
    }

    /// Recompute `unrealized_pnl` / `current_price` / `peak_price` for every
    /// open position from the latest tick price.
    pub fn update_unrealized(&self, ltp: impl Fn(&Segment, SecurityId) -> Option<Money>) {
        for entry in self.positions.iter() {
            let slot = entry.value();
            let mut pos = slot.position.write();
            if pos.net_qty == 0 {
                continue;
            }
            if let Some(price) = ltp(&pos.segment, pos.security_id) {
                pos.current_price = price;
                pos.unrealized_pnl = price
                    .sub(pos.buy_avg)
                    .unwrap()
                    .mul_scalar(Decimal::from(pos.net_qty))
                    .unwrap();
                if price > pos.peak_price {
                    pos.peak_price = price;
                }
            }
        }
    }

    pub fn get(&self, segment: &str, security_id: SecurityId, side: Side) -> Option<Position> {
        let key = PositionKey {
            segment: segment.to_string(),
            security_id,
            side,
        };
        self.positions
            .get(&key)
            .map(|slot| slot.position.read().clone())
    }

    /// Every tracked position, open or fully closed. Closed positions stay
    /// in the map (their `realized_pnl` is the session-report's source of
    /// truth for win/loss counting); only `list_open` filters them out.
    pub fn list_all(&self) -> Vec<Position> {
        self.positions.iter().map(|entry| entry.value().position.read().clone()).collect()
    }

    pub fn list_open(&self) -> Vec<Position> {
        self.positions
            .iter()
            .filter_map(|entry| {
                let pos = entry.value().position.read();
                if pos.net_qty > 0 {
                    Some(pos.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Mutate risk fields (`stop_loss`, `take_profit`, `peak_price`,
    /// `trailing_stop`, `breakeven_locked`) atomically under the position's
    /// per-key lock.
    pub fn update_risk_fields<F>(&self, segment: &str, security_id: SecurityId, side: Side, f: F)
    where
        F: FnOnce(&mut Position),
    {
        let key = PositionKey {
            segment: segment.to_string(),
            security_id,
            side,
        };
        let slot = self.slot(&key);
        let _guard = slot.lock.lock();
        let mut pos = slot.position.write();
        f(&mut pos);
    }

    /// Reset intraday buy/sell counters at the start of a new session.
    pub fn reset_day_quantities(&self) {
        for entry in self.positions.iter() {
            let mut pos = entry.value().position.write();
            pos.day_buy_qty = 0;
            pos.day_sell_qty = 0;
        }
    }
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn m(v: i64) -> Money {
        Money::from_decimal(Decimal::from(v))
    }

    #[test]
    fn weighted_average_entry_price() {
        let tracker = PositionTracker::new();
        tracker.add_fill("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(100), m(20));
        tracker.add_fill("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(120), m(20));
        let pos = tracker.get("NSE_FO", SecurityId(1), Side::Buy).unwrap();
        assert_eq!(pos.buy_avg.as_decimal(), dec!(110));
        assert_eq!(pos.net_qty, 150);
    }

    #[test]
    fn partial_exit_computes_realized_pnl_and_keeps_buy_avg() {
        let tracker = PositionTracker::new();
        tracker.add_fill("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(100), m(20));
        tracker.add_fill("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(120), m(20));
        let result = tracker
            .partial_exit("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(130), m(20))
            .unwrap();
        assert_eq!(result.realized_pnl.as_decimal(), dec!(1500));
        let pos = tracker.get("NSE_FO", SecurityId(1), Side::Buy).unwrap();
        assert_eq!(pos.buy_avg.as_decimal(), dec!(110));
        assert_eq!(pos.net_qty, 75);
    }

    #[test]
    fn oversell_is_rejected() {
        let tracker = PositionTracker::new();
        tracker.add_fill("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(100), m(20));
        let err = tracker
            .partial_exit("NSE_FO".into(), SecurityId(1), Side::Buy, 150, m(100), m(20))
            .unwrap_err();
        assert_eq!(err, crate::error::TradeError::InsufficientPosition);
        let pos = tracker.get("NSE_FO", SecurityId(1), Side::Buy).unwrap();
        assert_eq!(pos.net_qty, 75);
    }

    #[test]
    fn closed_position_absent_from_list_open() {
        let tracker = PositionTracker::new();
        tracker.add_fill("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(100), m(20));
        tracker
            .partial_exit("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(130), m(20))
            .unwrap();
        assert!(tracker.list_open().is_empty());
    }

    #[test]
    fn update_unrealized_uses_supplied_ltp() {
        let tracker = PositionTracker::new();
        tracker.add_fill("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(100), m(20));
        tracker.update_unrealized(|_, _| Some(m(120)));
        let pos = tracker.get("NSE_FO", SecurityId(1), Side::Buy).unwrap();
        assert_eq!(pos.unrealized_pnl.as_decimal(), dec!(1500));
    }
}
