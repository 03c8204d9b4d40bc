// =============================================================================
// BalanceProvider — available / used / total cash and realized P&L
// =============================================================================
//
// Grounded on `risk.rs`'s `Inner`/`RwLock`-guarded state struct for the
// simulated variant, and on `reconcile.rs`'s TTL-refresh-from-exchange
// pattern for the live variant.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::error::TradeError;
use crate::money::Money;

#[derive(Debug, Clone, Copy)]
pub enum UpdateKind {
    Debit,
    Credit,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct BalanceSnapshot {
    pub available: Money,
    pub used: Money,
    pub total: Money,
    pub realized_pnl: Money,
}

#[async_trait]
pub trait BalanceProvider: Send + Sync {
    async fn available_balance(&self) -> Money;
    async fn used_balance(&self) -> Money;
    async fn total_balance(&self) -> Money;
    async fn realized_pnl(&self) -> Money;
    async fn update_balance(&self, amount: Money, kind: UpdateKind) -> Result<(), TradeError>;
    async fn add_realized_pnl(&self, amount: Money);
    async fn reset(&self, amount: Money);
    async fn snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            available: self.available_balance().await,
            used: self.used_balance().await,
            total: self.total_balance().await,
            realized_pnl: self.realized_pnl().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Simulated
// ---------------------------------------------------------------------------

struct SimState {
    available: Money,
    used: Money,
    realized_pnl: Money,
}

pub struct SimulatedBalance {
    state: RwLock<SimState>,
}

impl SimulatedBalance {
    pub fn new(starting_balance: Money) -> Self {
        Self {
            state: RwLock::new(SimState {
                available: starting_balance,
                used: Money::zero(),
                realized_pnl: Money::zero(),
            }),
        }
    }
}

#[async_trait]
impl BalanceProvider for SimulatedBalance {
    async fn available_balance(&self) -> Money {
        self.state.read().available
    }

    async fn used_balance(&self) -> Money {
        self.state.read().used
    }

    async fn total_balance(&self) -> Money {
        let s = self.state.read();
        s.available.add(s.used).unwrap()
    }

    async fn realized_pnl(&self) -> Money {
        self.state.read().realized_pnl
    }

    async fn update_balance(&self, amount: Money, kind: UpdateKind) -> Result<(), TradeError> {
        let mut s = self.state.write();
        match kind {
            UpdateKind::Debit => {
                if s.available.as_decimal() < amount.as_decimal() {
                    return Err(TradeError::InsufficientBalance);
                }
                s.available = s.available.sub(amount).unwrap();
                s.used = s.used.add(amount).unwrap();
            }
            UpdateKind::Credit => {
                s.available = s.available.add(amount).unwrap();
                s.used = s.used.sub(amount).unwrap();
            }
        }
        Ok(())
    }

    async fn add_realized_pnl(&self, amount: Money) {
        let mut s = self.state.write();
        s.realized_pnl = s.realized_pnl.add(amount).unwrap();
    }

    async fn reset(&self, amount: Money) {
        let mut s = self.state.write();
        s.available = amount;
        s.used = Money::zero();
        s.realized_pnl = Money::zero();
    }
}

// ---------------------------------------------------------------------------
// Live
// ---------------------------------------------------------------------------

struct LiveCache {
    snapshot: BalanceSnapshot,
    fetched_at: Instant,
    degraded: bool,
}

/// Proxies to the broker funds endpoint with a 30-second TTL cache. On fetch
/// failure it retains the last known good values and sets `degraded`; on
/// first-ever failure it seeds zeroed defaults so reads keep serving.
pub struct LiveBalance {
    broker: Arc<dyn Broker>,
    cache: RwLock<LiveCache>,
    ttl: Duration,
}

impl LiveBalance {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            cache: RwLock::new(LiveCache {
                snapshot: BalanceSnapshot::default(),
                fetched_at: Instant::now() - Duration::from_secs(3600),
                degraded: true,
            }),
            ttl: Duration::from_secs(30),
        }
    }

    async fn refresh_if_stale(&self) {
        let stale = {
            let c = self.cache.read();
            c.fetched_at.elapsed() > self.ttl
        };
        if !stale {
            return;
        }
        match self.broker.funds().await {
            Ok(snapshot) => {
                let mut c = self.cache.write();
                c.snapshot = snapshot;
                c.fetched_at = Instant::now();
                c.degraded = false;
                debug!("live balance refreshed from broker");
            }
            Err(e) => {
                let mut c = self.cache.write();
                c.degraded = true;
                warn!(error = %e, "live balance fetch failed — serving last known good");
            }
        }
    }
}

#[async_trait]
impl BalanceProvider for LiveBalance {
    async fn available_balance(&self) -> Money {
        self.refresh_if_stale().await;
        self.cache.read().snapshot.available
    }

    async fn used_balance(&self) -> Money {
        self.refresh_if_stale().await;
        self.cache.read().snapshot.used
    }

    async fn total_balance(&self) -> Money {
        self.refresh_if_stale().await;
        self.cache.read().snapshot.total
    }

    async fn realized_pnl(&self) -> Money {
        self.refresh_if_stale().await;
        self.cache.read().snapshot.realized_pnl
    }

    async fn update_balance(&self, amount: Money, kind: UpdateKind) -> Result<(), TradeError> {
        // Local mutation keeps reads responsive between broker polls; the
        // next refresh reconciles against the broker's authoritative view.
        let mut c = self.cache.write();
        match kind {
            UpdateKind::Debit => {
                if c.snapshot.available.as_decimal() < amount.as_decimal() {
                    return Err(TradeError::InsufficientBalance);
                }
                c.snapshot.available = c.snapshot.available.sub(amount).unwrap();
                c.snapshot.used = c.snapshot.used.add(amount).unwrap();
            }
            UpdateKind::Credit => {
                c.snapshot.available = c.snapshot.available.add(amount).unwrap();
                c.snapshot.used = c.snapshot.used.sub(amount).unwrap();
            }
        }
        Ok(())
    }

    async fn add_realized_pnl(&self, amount: Money) {
        let mut c = self.cache.write();
        c.snapshot.realized_pnl = c.snapshot.realized_pnl.add(amount).unwrap();
    }

    async fn reset(&self, amount: Money) {
        let mut c = self.cache.write();
        c.snapshot = BalanceSnapshot {
            available: amount,
            used: Money::zero(),
            total: amount,
            realized_pnl: Money::zero(),
        };
    }
}

pub fn pct_of(amount: Money, pct: Decimal) -> Money {
    amount.mul_scalar(pct / Decimal::from(100)).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn m(v: i64) -> Money {
        Money::from_decimal(Decimal::from(v))
    }

    #[tokio::test]
    async fn debit_then_credit_round_trip() {
        let bal = SimulatedBalance::new(m(100_000));
        bal.update_balance(m(7500), UpdateKind::Debit).await.unwrap();
        assert_eq!(bal.available_balance().await, m(92_500));
        assert_eq!(bal.used_balance().await, m(7500));
        bal.update_balance(m(9000), UpdateKind::Credit).await.unwrap();
        assert_eq!(bal.available_balance().await, m(101_500));
        assert_eq!(bal.used_balance().await, m(-1500));
    }

    #[tokio::test]
    async fn debit_exceeding_available_is_rejected() {
        let bal = SimulatedBalance::new(m(5_000));
        let err = bal
            .update_balance(m(7_500), UpdateKind::Debit)
            .await
            .unwrap_err();
        assert_eq!(err, TradeError::InsufficientBalance);
        assert_eq!(bal.available_balance().await, m(5_000));
    }

    #[tokio::test]
    async fn total_equals_available_plus_used_invariant() {
        let bal = SimulatedBalance::new(m(100_000));
        bal.update_balance(m(20_000), UpdateKind::Debit).await.unwrap();
        let total = bal.total_balance().await;
        assert_eq!(total, m(100_000));
    }

    #[tokio::test]
    async fn realized_pnl_accumulates() {
        let bal = SimulatedBalance::new(m(0));
        bal.add_realized_pnl(m(1500)).await;
        bal.add_realized_pnl(Money::from_decimal(dec!(-750))).await;
        assert_eq!(bal.realized_pnl().await.as_decimal(), dec!(750));
    }

    #[test]
    fn pct_of_computes_fraction() {
        let allocated = pct_of(m(100_000), dec!(2));
        assert_eq!(allocated, m(2000));
    }
}
