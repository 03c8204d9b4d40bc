// =============================================================================
// AtomicTrade — single choke point for BUY/SELL
// =============================================================================
//
// Grounded on `execution.rs::ExecutionEngine`, generalized from its
// risk-precheck-then-demo/live-branch shape to the exact acquire order spec
// §5 mandates: balance -> position -> order store, never the reverse.
// Idempotency replay is an in-process reserve-then-record map keyed by
// `idempotency_key`, scoped to this `AtomicTrade`'s lifetime (one process,
// one session) — not persisted to `DurableStore`. A key is marked in-flight
// the instant it's first seen, under the same lock that checks for a prior
// result, so two concurrent calls with the same key can't both pass.
// =============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::balance::{BalanceProvider, UpdateKind};
use crate::error::TradeError;
use crate::money::Money;
use crate::position::PositionTracker;
use crate::store::{DurableStore, StoreOp};
use crate::types::{Mode, Order, OrderStatus, SecurityId, Segment, Side};

#[derive(Debug, Clone)]
pub struct TradeOutcome {
    pub ok: bool,
    pub reason: Option<TradeError>,
    pub order_id: Option<String>,
    pub realized_pnl: Option<Money>,
}

impl TradeOutcome {
    fn rejected(reason: TradeError) -> Self {
        Self { ok: false, reason: Some(reason), order_id: None, realized_pnl: None }
    }
}

/// One idempotency-key slot: either a call is currently executing for it, or
/// it has already produced a final outcome to replay.
#[derive(Clone)]
enum ReplaySlot {
    InFlight,
    Done(TradeOutcome),
}

pub struct AtomicTrade {
    balance: Arc<dyn BalanceProvider>,
    positions: Arc<PositionTracker>,
    store: Arc<dyn DurableStore>,
    /// Idempotency replay cache keyed by `idempotency_key`. Recent entries
    /// only — they age out naturally since keys are per-decision-tick.
    replay: Mutex<std::collections::HashMap<String, ReplaySlot>>,
    session_id: String,
    mode: Mode,
}

impl AtomicTrade {
    pub fn new(
        balance: Arc<dyn BalanceProvider>,
        positions: Arc<PositionTracker>,
        store: Arc<dyn DurableStore>,
        session_id: impl Into<String>,
        mode: Mode,
    ) -> Self {
        Self {
            balance,
            positions,
            store,
            replay: Mutex::new(std::collections::HashMap::new()),
            session_id: session_id.into(),
            mode,
        }
    }

    /// Checks for a prior or in-flight result and, if this is the first time
    /// `key` has been seen, atomically reserves it as in-flight. Both the
    /// check and the reservation happen under one lock acquisition so two
    /// concurrent calls with the same key can't both proceed to `remember`
    /// their own success. If the reserving call's future is dropped before
    /// it reaches `remember` (e.g. the decision-loop task is aborted
    /// mid-await during shutdown), that key is stuck `InFlight` for the rest
    /// of this `AtomicTrade`'s life — acceptable since keys are scoped to
    /// one decision tick and the process is exiting anyway.
    fn replayed(&self, idempotency_key: Option<&str>) -> Option<TradeOutcome> {
        let key = idempotency_key?;
        let mut replay = self.replay.lock();
        match replay.get(key) {
            Some(ReplaySlot::Done(outcome)) => Some(outcome.clone()),
            Some(ReplaySlot::InFlight) => {
                Some(TradeOutcome::rejected(TradeError::DuplicateRequest))
            }
            None => {
                replay.insert(key.to_string(), ReplaySlot::InFlight);
                None
            }
        }
    }

    fn remember(&self, idempotency_key: Option<&str>, outcome: &TradeOutcome) {
        if let Some(key) = idempotency_key {
            self.replay
                .lock()
                .insert(key.to_string(), ReplaySlot::Done(outcome.clone()));
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn buy(
        &self,
        segment: Segment,
        security_id: SecurityId,
        side: Side,
        qty: i64,
        price: Money,
        fee: Money,
        idempotency_key: Option<&str>,
    ) -> TradeOutcome {
        if let Some(prior) = self.replayed(idempotency_key) {
            return prior;
        }

        let cost = price.mul_scalar(Decimal::from(qty)).unwrap().add(fee).unwrap();

        if self.balance.available_balance().await.as_decimal() < cost.as_decimal() {
            let outcome = TradeOutcome::rejected(TradeError::InsufficientBalance);
            self.remember(idempotency_key, &outcome);
            return outcome;
        }

        if let Err(reason) = self.balance.update_balance(cost, UpdateKind::Debit).await {
            let outcome = TradeOutcome::rejected(reason);
            self.remember(idempotency_key, &outcome);
            return outcome;
        }

        self.positions
            .add_fill(segment.clone(), security_id, side, qty, price, fee);

        let mut order = Order::new_pending(
            security_id,
            segment,
            Side::Buy,
            qty,
            price,
            fee,
            self.session_id.clone(),
            self.mode,
        );
        order.filled_price = price;
        order.filled_quantity = qty;
        order.status = OrderStatus::Filled;
        order.filled_at = Some(chrono::Utc::now());
        self.persist_order(&order, true).await;

        info!(order_id = %order.order_id, qty, price = %price, "buy executed");

        let outcome = TradeOutcome {
            ok: true,
            reason: None,
            order_id: Some(order.order_id),
            realized_pnl: None,
        };
        self.remember(idempotency_key, &outcome);
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn sell(
        &self,
        segment: Segment,
        security_id: SecurityId,
        side: Side,
        qty: i64,
        price: Money,
        fee: Money,
        idempotency_key: Option<&str>,
    ) -> TradeOutcome {
        if let Some(prior) = self.replayed(idempotency_key) {
            return prior;
        }

        let preview = match self.positions.preview_exit(
            segment.clone(),
            security_id,
            side,
            qty,
            price,
            fee,
        ) {
            Ok(preview) => preview,
            Err(reason) => {
                let outcome = TradeOutcome::rejected(reason);
                self.remember(idempotency_key, &outcome);
                return outcome;
            }
        };

        self.balance
            .update_balance(preview.net_proceeds, UpdateKind::Credit)
            .await
            .ok();
        self.balance.add_realized_pnl(preview.realized_pnl).await;

        let exit = match self.positions.partial_exit(
            segment.clone(),
            security_id,
            side,
            qty,
            price,
            fee,
        ) {
            Ok(exit) => exit,
            Err(reason) => {
                // Position changed between preview and commit (concurrent
                // sell on the same key). Reverse the credit already applied.
                if let Err(reverse_err) = self
                    .balance
                    .update_balance(preview.net_proceeds, UpdateKind::Debit)
                    .await
                {
                    warn!(
                        security_id = %security_id,
                        error = %reverse_err,
                        amount = %preview.net_proceeds,
                        "sell rollback could not debit back an already-applied credit; available balance is overstated"
                    );
                }
                self.balance.add_realized_pnl(preview.realized_pnl.neg()).await;
                let outcome = TradeOutcome::rejected(reason);
                self.remember(idempotency_key, &outcome);
                return outcome;
            }
        };

        // A concurrent fill on this key between preview and commit can move
        // buy_avg, so `exit` (computed under the commit's own lock) may
        // differ from the `preview` already credited above. Reconcile the
        // balance to the authoritative commit-time figures.
        let proceeds_delta = exit.net_proceeds.sub(preview.net_proceeds).unwrap();
        if proceeds_delta.is_negative() {
            self.balance
                .update_balance(proceeds_delta.neg(), UpdateKind::Debit)
                .await
                .ok();
        } else {
            self.balance
                .update_balance(proceeds_delta, UpdateKind::Credit)
                .await
                .ok();
        }
        self.balance
            .add_realized_pnl(exit.realized_pnl.sub(preview.realized_pnl).unwrap())
            .await;

        let remaining = self
            .positions
            .get(&segment, security_id, side)
            .map(|p| p.net_qty)
            .unwrap_or(0);

        let mut order = Order::new_pending(
            security_id,
            segment,
            Side::Sell,
            qty,
            price,
            fee,
            self.session_id.clone(),
            self.mode,
        );
        order.filled_price = price;
        order.filled_quantity = qty;
        order.status = OrderStatus::Filled;
        order.filled_at = Some(chrono::Utc::now());

        let remove_from_open = remaining == 0;
        self.persist_order(&order, remove_from_open).await;

        info!(
            order_id = %order.order_id,
            qty,
            price = %price,
            realized_pnl = %exit.realized_pnl,
            "sell executed"
        );

        let outcome = TradeOutcome {
            ok: true,
            reason: None,
            order_id: Some(order.order_id),
            realized_pnl: Some(exit.realized_pnl),
        };
        self.remember(idempotency_key, &outcome);
        outcome
    }

    async fn persist_order(&self, order: &Order, position_open: bool) {
        let order_json = serde_json::to_string(order).unwrap_or_default();
        let mut ops = vec![
            StoreOp::HSet {
                key: format!("order:{}", order.order_id),
                field: "record".to_string(),
                value: order_json,
            },
            StoreOp::LPush {
                key: format!("orders:{}:{}", order.mode, order.session_id),
                value: order.order_id.clone(),
            },
        ];
        if !position_open {
            ops.push(StoreOp::SRem {
                key: "pos:open".to_string(),
                member: format!("{}:{}", order.segment, order.security_id),
            });
        } else {
            ops.push(StoreOp::SAdd {
                key: "pos:open".to_string(),
                member: format!("{}:{}", order.segment, order.security_id),
            });
        }

        if let Err(e) = self.store.atomic(ops).await {
            warn!(error = %e, "failed to persist order to durable store");
        }
    }

    /// Read back the most recent orders for this session from the durable
    /// store's `orders:<mode>:<session_id>` list, most recent first.
    pub async fn recent_orders(&self, limit: usize) -> Vec<Order> {
        let key = format!("orders:{}:{}", self.mode, self.session_id);
        let ids = match self.store.lrange(&key, 0, limit as isize - 1).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "failed to read order log");
                return Vec::new();
            }
        };

        let mut orders = Vec::with_capacity(ids.len());
        for id in ids {
            let record_key = format!("order:{}", id);
            if let Ok(Some(json)) = self.store.hget(&record_key, "record").await {
                if let Ok(order) = serde_json::from_str::<Order>(&json) {
                    orders.push(order);
                }
            }
        }
        orders
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::SimulatedBalance;
    use crate::store::NullStore;
    use rust_decimal_macros::dec;

    fn m(v: i64) -> Money {
        Money::from_decimal(Decimal::from(v))
    }

    fn engine(starting: i64) -> AtomicTrade {
        AtomicTrade::new(
            Arc::new(SimulatedBalance::new(m(starting))),
            Arc::new(PositionTracker::new()),
            Arc::new(NullStore::new()),
            "sess-1",
            Mode::Paper,
        )
    }

    #[tokio::test]
    async fn profit_round_trip_matches_scenario_one() {
        let trade = engine(100_000);
        trade
            .buy("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(100), m(20), None)
            .await;
        let outcome = trade
            .sell("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(120), m(20), None)
            .await;
        assert!(outcome.ok);
        assert_eq!(outcome.realized_pnl.unwrap().as_decimal(), dec!(1500));
        assert_eq!(
            trade.balance.available_balance().await.as_decimal(),
            dec!(101460)
        );
    }

    #[tokio::test]
    async fn loss_round_trip_matches_scenario_two() {
        let trade = engine(100_000);
        trade
            .buy("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(100), m(20), None)
            .await;
        trade
            .sell("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(90), m(20), None)
            .await;
        assert_eq!(trade.balance.available_balance().await.as_decimal(), dec!(99210));
    }

    #[tokio::test]
    async fn averaging_and_partial_exit_matches_scenario_three() {
        let trade = engine(100_000);
        trade
            .buy("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(100), m(20), None)
            .await;
        trade
            .buy("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(120), m(20), None)
            .await;
        let outcome = trade
            .sell("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(130), m(20), None)
            .await;
        assert_eq!(outcome.realized_pnl.unwrap().as_decimal(), dec!(1500));
        // available = 100000 - 7520 (buy 1) - 9020 (buy 2) + 9730 (sell net proceeds)
        assert_eq!(trade.balance.available_balance().await.as_decimal(), dec!(93190));
    }

    #[tokio::test]
    async fn insufficient_balance_rejects_with_no_state_change() {
        let trade = engine(5_000);
        let outcome = trade
            .buy("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(100), m(20), None)
            .await;
        assert!(!outcome.ok);
        assert_eq!(outcome.reason, Some(TradeError::InsufficientBalance));
        assert_eq!(trade.balance.available_balance().await, m(5_000));
    }

    #[tokio::test]
    async fn oversell_rejects_and_leaves_position_unchanged() {
        let trade = engine(100_000);
        trade
            .buy("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(100), m(20), None)
            .await;
        let outcome = trade
            .sell("NSE_FO".into(), SecurityId(1), Side::Buy, 150, m(100), m(20), None)
            .await;
        assert!(!outcome.ok);
        assert_eq!(outcome.reason, Some(TradeError::InsufficientPosition));
        let pos = trade.positions.get("NSE_FO", SecurityId(1), Side::Buy).unwrap();
        assert_eq!(pos.net_qty, 75);
    }

    #[tokio::test]
    async fn idempotency_key_replays_prior_result() {
        let trade = engine(100_000);
        let first = trade
            .buy("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(100), m(20), Some("key-1"))
            .await;
        let second = trade
            .buy("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(100), m(20), Some("key-1"))
            .await;
        assert_eq!(first.order_id, second.order_id);
        // Balance debited only once.
        assert_eq!(trade.balance.available_balance().await.as_decimal(), dec!(92480));
    }

    #[tokio::test]
    async fn recent_orders_reads_back_most_recent_first() {
        let trade = engine(100_000);
        trade
            .buy("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(100), m(20), None)
            .await;
        trade
            .sell("NSE_FO".into(), SecurityId(1), Side::Buy, 75, m(120), m(20), None)
            .await;

        let orders = trade.recent_orders(10).await;
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].side, Side::Sell);
        assert_eq!(orders[0].status, OrderStatus::Filled);
        assert_eq!(orders[1].side, Side::Buy);
        assert_eq!(orders[1].status, OrderStatus::Filled);
    }
}
