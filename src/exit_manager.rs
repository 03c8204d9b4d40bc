// =============================================================================
// ExitManager — first-match-wins exit ladder evaluated every decision tick
// =============================================================================
//
// Grounded on `exit/monitor.rs::run_exit_monitor`'s collect-then-act shape
// (iterate open positions while holding only read access, decide, release,
// then act) and on `exit/triple_barrier.rs::BarrierState::evaluate`'s
// "only tighten toward price, never loosen" discipline for the breakeven
// and trailing steps. The ladder's own ordering is new: the triple-barrier
// teacher orders TP1/TP2/time; this crate's order is emergency floor,
// session invariant, signal invalidation, take-profit, hard stop-loss,
// breakeven lock, trailing stop, exactly as laid out in the ladder spec.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::atomic_trade::AtomicTrade;
use crate::broker::Broker;
use crate::money::Money;
use crate::position::{Position, PositionTracker};
use crate::session_guard::{SessionGuard, SessionGuardVerdict};
use crate::types::{Direction, SessionPnl};

#[derive(Debug, Clone, Copy)]
pub struct ExitConfig {
    pub emergency_floor_rupees: Money,
    pub breakeven_threshold_pct: Decimal,
    pub trail_pct: Decimal,
    pub rupee_step: Option<Money>,
    pub fee_per_lot: Money,
    /// Window inside which the same (position_id, reason) exit is not
    /// reissued, guarding against duplicate market orders on retry.
    pub idempotency_window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    EmergencyFloor,
    SessionInvariant,
    SignalInvalidation,
    TakeProfit,
    StopLoss,
}

impl ExitReason {
    fn as_str(self) -> &'static str {
        match self {
            ExitReason::EmergencyFloor => "emergency_floor",
            ExitReason::SessionInvariant => "session_invariant",
            ExitReason::SignalInvalidation => "signal_invalidation",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
        }
    }
}

/// Evaluates and enforces the per-position exit ladder. Owns nothing about
/// entries; `EntryManager` and `ExitManager` share `PositionTracker` and
/// `AtomicTrade` but are otherwise independent.
pub struct ExitManager {
    config: ExitConfig,
    recent_exits: Mutex<HashMap<(String, &'static str), Instant>>,
}

impl ExitManager {
    pub fn new(config: ExitConfig) -> Self {
        Self { config, recent_exits: Mutex::new(HashMap::new()) }
    }

    fn already_exited_recently(&self, position_id: &str, reason: ExitReason) -> bool {
        let mut map = self.recent_exits.lock();
        let key = (position_id.to_string(), reason.as_str());
        if let Some(at) = map.get(&key) {
            if at.elapsed() < self.config.idempotency_window {
                return true;
            }
        }
        map.insert(key, Instant::now());
        false
    }

    /// Run one decision tick: evaluate the ladder for every open position
    /// and execute, in order, the first rule that fires. Exceptions inside
    /// a single position's evaluation are logged and the loop continues,
    /// never aborting the whole tick (spec's failure-semantics note).
    pub async fn run_tick(
        &self,
        positions: &PositionTracker,
        session_guard: &SessionGuard,
        session_pnl: &SessionPnl,
        opposite_signal_by_security: &HashMap<crate::types::SecurityId, Direction>,
        broker: &dyn Broker,
        atomic_trade: &AtomicTrade,
    ) {
        let session_verdict = session_guard.check(session_pnl);

        let open = positions.list_open();
        for position in open {
            if let Err(e) = self
                .evaluate_one(&position, session_verdict, opposite_signal_by_security, positions, broker, atomic_trade)
                .await
            {
                error!(position_id = %position.position_id, error = %e, "exit evaluation failed for position, continuing");
            }
        }
    }

    async fn evaluate_one(
        &self,
        position: &Position,
        session_verdict: SessionGuardVerdict,
        opposite_signal_by_security: &HashMap<crate::types::SecurityId, Direction>,
        positions: &PositionTracker,
        broker: &dyn Broker,
        atomic_trade: &AtomicTrade,
    ) -> anyhow::Result<()> {
        // 1. Emergency floor.
        let loss = Money::zero().sub(position.unrealized_pnl).unwrap_or(Money::zero());
        if position.unrealized_pnl.is_negative() && loss.as_decimal() >= self.config.emergency_floor_rupees.as_decimal() {
            return self.execute_exit(position, ExitReason::EmergencyFloor, broker, atomic_trade).await;
        }

        // 2. Session invariant: handled once per tick by the caller via
        // `force_exit_all`, but a position evaluated here before that sweep
        // runs should still not take any other action.
        if !session_verdict.is_ok() {
            return self.execute_exit(position, ExitReason::SessionInvariant, broker, atomic_trade).await;
        }

        // 3. Signal invalidation: an opposite-direction proceed signal for
        // this instrument closes the position immediately.
        let entry_direction = Direction::Bullish; // long-only book: every held position was entered bullish on its right
        if let Some(signal_dir) = opposite_signal_by_security.get(&position.security_id) {
            if *signal_dir == entry_direction.opposite() {
                return self.execute_exit(position, ExitReason::SignalInvalidation, broker, atomic_trade).await;
            }
        }

        // 4. Take-profit.
        if position.current_price.as_decimal() >= position.take_profit.as_decimal() {
            return self.execute_exit(position, ExitReason::TakeProfit, broker, atomic_trade).await;
        }

        // 5. Hard stop-loss.
        if position.current_price.as_decimal() <= position.stop_loss.as_decimal() {
            return self.execute_exit(position, ExitReason::StopLoss, broker, atomic_trade).await;
        }

        // 6. Breakeven lock — only tightens, never loosens, and only fires once.
        let breakeven_trigger = position
            .buy_avg
            .mul_scalar(Decimal::ONE + self.config.breakeven_threshold_pct)
            .unwrap_or(position.buy_avg);
        if !position.breakeven_locked && position.current_price.as_decimal() >= breakeven_trigger.as_decimal() {
            let new_floor = position.buy_avg.add(self.config.fee_per_lot).unwrap_or(position.buy_avg);
            positions.update_risk_fields(&position.segment, position.security_id, position.side, |p| {
                p.stop_loss = p.stop_loss.max(new_floor);
                p.breakeven_locked = true;
            });
            info!(position_id = %position.position_id, floor = %new_floor, "breakeven lock engaged");
            return Ok(());
        }

        // 7. Trailing stop — peak only ever rises, stop only ever tightens.
        let new_peak = position.peak_price.max(position.current_price);
        let mut new_trail = new_peak
            .mul_scalar(Decimal::ONE - self.config.trail_pct)
            .unwrap_or(new_peak);
        if let Some(step) = self.config.rupee_step {
            if !step.is_zero() {
                let steps = (new_trail.as_decimal() / step.as_decimal()).floor();
                new_trail = Money::from_decimal(steps * step.as_decimal());
            }
        }
        let new_stop = position.stop_loss.max(new_trail);
        positions.update_risk_fields(&position.segment, position.security_id, position.side, |p| {
            p.peak_price = new_peak;
            p.stop_loss = new_stop;
        });

        Ok(())
    }

    async fn execute_exit(
        &self,
        position: &Position,
        reason: ExitReason,
        broker: &dyn Broker,
        atomic_trade: &AtomicTrade,
    ) -> anyhow::Result<()> {
        if self.already_exited_recently(&position.position_id, reason) {
            return Ok(());
        }

        let fill = broker
            .sell_market(position.segment.clone(), position.security_id, position.net_qty, self.config.fee_per_lot)
            .await;
        if !fill.ok {
            warn!(position_id = %position.position_id, reason = reason.as_str(), error = ?fill.error, "exit order rejected, will retry next tick");
            return Ok(());
        }

        let outcome = atomic_trade
            .sell(
                position.segment.clone(),
                position.security_id,
                position.side,
                fill.filled_qty,
                fill.filled_price,
                self.config.fee_per_lot,
                Some(&format!("{}:{}", position.position_id, reason.as_str())),
            )
            .await;

        if outcome.ok {
            info!(position_id = %position.position_id, reason = reason.as_str(), pnl = ?outcome.realized_pnl, "position exited");
        } else {
            warn!(position_id = %position.position_id, reason = reason.as_str(), rejection = ?outcome.reason, "exit bookkeeping rejected after fill");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::SimulatedBalance;
    use crate::broker::PaperBroker;
    use crate::store::null_store::NullStore;
    use crate::tick_cache::TickCache;
    use crate::types::{SecurityId, Side, Tick};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn config() -> ExitConfig {
        ExitConfig {
            emergency_floor_rupees: Money::from_decimal(dec!(5000)),
            breakeven_threshold_pct: dec!(0.10),
            trail_pct: dec!(0.05),
            rupee_step: Some(Money::from_decimal(dec!(0.5))),
            fee_per_lot: Money::from_decimal(dec!(20)),
            idempotency_window: Duration::from_secs(10),
        }
    }

    fn make_position(positions: &PositionTracker, security_id: SecurityId, buy_avg: Decimal, qty: i64) {
        positions.add_fill("NSE_FO".to_string(), security_id, Side::Buy, qty, Money::from_decimal(buy_avg), Money::zero());
        positions.update_risk_fields("NSE_FO", security_id, Side::Buy, |p| {
            p.peak_price = Money::from_decimal(buy_avg);
            p.stop_loss = Money::from_decimal(buy_avg * dec!(0.9));
            p.take_profit = Money::from_decimal(buy_avg * dec!(1.2));
            p.current_price = Money::from_decimal(buy_avg);
        });
    }

    fn tick(security_id: SecurityId, ltp: Decimal) -> Tick {
        Tick {
            segment: "NSE_FO".into(),
            security_id,
            ltp: Money::from_decimal(ltp),
            atp: Money::zero(),
            day_high: Money::zero(),
            day_low: Money::zero(),
            volume: 0,
            server_timestamp: 1,
            received_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn take_profit_closes_position() {
        let positions = PositionTracker::new();
        let sid = SecurityId(1);
        make_position(&positions, sid, dec!(100), 75);
        positions.update_risk_fields("NSE_FO", sid, Side::Buy, |p| p.current_price = Money::from_decimal(dec!(121)));

        let cache = Arc::new(TickCache::new(None));
        cache.put(tick(sid, dec!(121)));
        let broker = PaperBroker::new(cache.clone());
        let balance = Arc::new(SimulatedBalance::new(Money::from_decimal(dec!(100000))));
        let store = Arc::new(NullStore::new());
        let positions_arc = Arc::new(positions);
        let atomic_trade = AtomicTrade::new(balance.clone(), positions_arc.clone(), store, "sess-1", crate::types::Mode::Paper);

        let manager = ExitManager::new(config());
        let guard = SessionGuard::new(crate::session_guard::SessionGuardConfig {
            market_window: crate::session_guard::MarketWindow {
                open: chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                close: chrono::NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
                grace: chrono::Duration::hours(1),
                tz_offset: crate::session_guard::MarketWindow::ist(),
            },
            max_day_loss: Money::from_decimal(dec!(100000)),
            stale_threshold: Duration::from_secs(3600),
        });
        guard.record_heartbeat();

        let mut position = positions_arc.get("NSE_FO", sid, Side::Buy).unwrap();
        position.current_price = Money::from_decimal(dec!(121));

        manager
            .evaluate_one(&position, SessionGuardVerdict::Ok, &HashMap::new(), &positions_arc, &broker, &atomic_trade)
            .await
            .unwrap();

        let remaining = positions_arc.get("NSE_FO", sid, Side::Buy).unwrap();
        assert_eq!(remaining.net_qty, 0);
    }

    #[tokio::test]
    async fn breakeven_lock_only_tightens_and_sets_once() {
        let positions = PositionTracker::new();
        let sid = SecurityId(2);
        make_position(&positions, sid, dec!(100), 75);

        let cache = Arc::new(TickCache::new(None));
        let broker = PaperBroker::new(cache.clone());
        let balance = Arc::new(SimulatedBalance::new(Money::from_decimal(dec!(100000))));
        let store = Arc::new(NullStore::new());
        let positions_arc = Arc::new(positions);
        let atomic_trade = AtomicTrade::new(balance, positions_arc.clone(), store, "sess-1", crate::types::Mode::Paper);

        let manager = ExitManager::new(config());

        let mut position = positions_arc.get("NSE_FO", sid, Side::Buy).unwrap();
        position.current_price = Money::from_decimal(dec!(111));

        manager
            .evaluate_one(&position, SessionGuardVerdict::Ok, &HashMap::new(), &positions_arc, &broker, &atomic_trade)
            .await
            .unwrap();

        let updated = positions_arc.get("NSE_FO", sid, Side::Buy).unwrap();
        assert!(updated.breakeven_locked);
        assert_eq!(updated.stop_loss, Money::from_decimal(dec!(120)));
    }
}
