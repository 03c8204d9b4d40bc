// =============================================================================
// SessionGuard — ordered circuit breakers gating every entry/exit decision
// =============================================================================
//
// Generalizes `risk.rs::RiskEngine::can_trade`'s ordered-check, first-match-
// wins shape (daily loss -> consecutive losses -> drawdown -> trade limit)
// into the checks this engine actually needs: market hours, day loss limit,
// feed staleness, and an external panic flag. The crypto bot trades 24/7 so
// it never needed a market-hours window; this crate adds one since options
// only trade inside a fixed daily session.
// =============================================================================

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveTime, Utc, Weekday};
use parking_lot::{Mutex, RwLock};
use tracing::warn;

use crate::atomic_trade::AtomicTrade;
use crate::broker::Broker;
use crate::position::PositionTracker;
use crate::types::SessionPnl;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Verdict returned by `SessionGuard::check`. Exactly one of these holds at
/// any moment; callers match on it rather than inspecting booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionGuardVerdict {
    Ok,
    MarketClosed,
    DayLossLimit,
    FeedStale,
    Panic,
}

impl SessionGuardVerdict {
    pub fn is_ok(self) -> bool {
        matches!(self, SessionGuardVerdict::Ok)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MarketWindow {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub grace: ChronoDuration,
    /// `open`/`close` are wall-clock times in this offset (NSE trades
    /// 09:15-15:30 IST, not UTC). `contains()` converts `now` into it
    /// before comparing.
    pub tz_offset: FixedOffset,
}

impl MarketWindow {
    /// India Standard Time, UTC+5:30 — no DST, so a fixed offset suffices.
    pub fn ist() -> FixedOffset {
        FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap()
    }

    fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz_offset);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let t = local.time();
        let open_with_grace = self.open - self.grace;
        let close_with_grace = self.close + self.grace;
        t >= open_with_grace && t <= close_with_grace
    }
}

pub struct SessionGuardConfig {
    pub market_window: MarketWindow,
    pub max_day_loss: crate::money::Money,
    pub stale_threshold: std::time::Duration,
}

/// Ordered circuit breaker in front of every entry and exit decision.
/// `check()` is cheap enough to call once per symbol per decision tick.
pub struct SessionGuard {
    config: SessionGuardConfig,
    panic: AtomicBool,
    last_heartbeat_epoch_ms: AtomicI64,
    last_verdict: RwLock<SessionGuardVerdict>,
    force_exit_lock: Mutex<()>,
}

impl SessionGuard {
    pub fn new(config: SessionGuardConfig) -> Self {
        Self {
            config,
            panic: AtomicBool::new(false),
            last_heartbeat_epoch_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            last_verdict: RwLock::new(SessionGuardVerdict::Ok),
            force_exit_lock: Mutex::new(()),
        }
    }

    /// Call whenever `WSManager` observes the feed is alive (a tick or a
    /// heartbeat ack). `check()`'s staleness rule is measured from this.
    pub fn record_heartbeat(&self) {
        self.last_heartbeat_epoch_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Set externally (signal handler, admin endpoint) to halt all trading
    /// immediately regardless of any other condition.
    pub fn set_panic(&self, value: bool) {
        self.panic.store(value, Ordering::SeqCst);
        if value {
            warn!("session guard panic flag set -- halting all trading");
        }
    }

    pub fn is_panicked(&self) -> bool {
        self.panic.load(Ordering::SeqCst)
    }

    /// Ordered, first-match-wins check: market window, day loss, feed
    /// staleness, panic flag. Cheapest/cheapest-to-reason-about checks run
    /// first.
    pub fn check(&self, session_pnl: &SessionPnl) -> SessionGuardVerdict {
        let verdict = self.evaluate(session_pnl);
        *self.last_verdict.write() = verdict;
        verdict
    }

    fn evaluate(&self, session_pnl: &SessionPnl) -> SessionGuardVerdict {
        if self.is_panicked() {
            return SessionGuardVerdict::Panic;
        }

        let now = Utc::now();
        if !self.config.market_window.contains(now) {
            return SessionGuardVerdict::MarketClosed;
        }

        let worst = session_pnl.total.min(crate::money::Money::zero());
        let loss_magnitude = worst.neg();
        if loss_magnitude.as_decimal() >= self.config.max_day_loss.as_decimal() {
            return SessionGuardVerdict::DayLossLimit;
        }

        let last_heartbeat = self.last_heartbeat_epoch_ms.load(Ordering::Relaxed);
        let age_ms = now.timestamp_millis() - last_heartbeat;
        if age_ms > self.config.stale_threshold.as_millis() as i64 {
            return SessionGuardVerdict::FeedStale;
        }

        SessionGuardVerdict::Ok
    }

    pub fn last_verdict(&self) -> SessionGuardVerdict {
        *self.last_verdict.read()
    }

    /// Market-sell every open position via `AtomicTrade`, logging and
    /// continuing past any single failure rather than aborting the sweep.
    /// Serialized so two overlapping panics/day-loss trips don't race each
    /// other into double-exiting the same position. Positions here are
    /// always long (option buying only), so every exit is a sell.
    pub async fn force_exit_all(&self, positions: &PositionTracker, broker: &dyn Broker, atomic_trade: &AtomicTrade, fee_per_lot: crate::money::Money) {
        let _guard = self.force_exit_lock.lock();

        for position in positions.list_open() {
            let qty = position.net_qty;
            if qty <= 0 {
                continue;
            }

            let fill = broker.sell_market(position.segment.clone(), position.security_id, qty, fee_per_lot).await;
            if !fill.ok {
                warn!(
                    security_id = %position.security_id,
                    error = ?fill.error,
                    "force_exit_all: order failed, will retry on next decision tick"
                );
                continue;
            }

            let outcome = atomic_trade
                .sell(
                    position.segment.clone(),
                    position.security_id,
                    position.side,
                    fill.filled_qty,
                    fill.filled_price,
                    fee_per_lot,
                    Some(&format!("force_exit:{}", position.position_id)),
                )
                .await;

            if !outcome.ok {
                warn!(security_id = %position.security_id, reason = ?outcome.reason, "force_exit_all: bookkeeping rejected after fill");
            }
        }
    }
}
