// =============================================================================
// EntryManager — per-decision-tick new-position pipeline
// =============================================================================
//
// Grounded on `strategy.rs::StrategyEngine::evaluate_symbol`'s per-symbol
// pipeline shape (gather candles -> indicator verdict -> size -> submit),
// narrowed to the exact 10-step sequence this crate's entry ladder needs:
// session gate, per-symbol indicator evaluation, concurrency caps, option
// selection, premium lookup, sizing, atomic buy, then risk-field seeding
// and WSManager position registration.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{NaiveDate, Weekday};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::atomic_trade::AtomicTrade;
use crate::balance::BalanceProvider;
use crate::broker::Broker;
use crate::indicators::IndicatorEngine;
use crate::option_picker::OptionPicker;
use crate::position::PositionTracker;
use crate::quantity_sizer::QuantitySizer;
use crate::session_guard::SessionGuard;
use crate::tick_cache::TickCache;
use crate::types::{CandleSeries, Mode, SecurityId, SessionPnl, Side};
use crate::ws_manager::WSManager;

/// Per-symbol configuration needed to evaluate and size one entry.
#[derive(Debug, Clone)]
pub struct SymbolEntryConfig {
    pub symbol: String,
    pub idx_segment: String,
    pub idx_security_id: crate::types::SecurityId,
    pub opt_segment: String,
    pub strike_step: i64,
    pub lot_size: Option<i64>,
    pub qty_multiplier: i64,
    pub expiry_weekday: Weekday,
}

#[derive(Debug, Clone, Copy)]
pub struct GlobalEntryConfig {
    pub allocation_pct: Decimal,
    pub slippage_buffer_pct: Decimal,
    pub max_lots_per_trade: i64,
    pub max_concurrent_positions: usize,
    pub sl_pct: Decimal,
    pub tp_pct: Decimal,
    pub fee_per_lot: crate::money::Money,
    /// Maximum concurrent open positions per (symbol, direction) pair.
    pub per_symbol_direction_cap: usize,
}

/// Supplies the candle series `IndicatorEngine` needs. Grounded on the
/// teacher's `CandleBuffer`, but kept abstract here since candle seeding is
/// an external collaborator out of this crate's core scope.
pub trait CandleProvider: Send + Sync {
    fn primary(&self, symbol: &str) -> Option<CandleSeries>;
    fn secondary(&self, symbol: &str) -> Option<CandleSeries>;
}

pub struct EntryManager {
    symbols: Vec<SymbolEntryConfig>,
    global: GlobalEntryConfig,
    indicator_engine: IndicatorEngine,
    option_picker: OptionPicker,
    mode: Mode,
}

impl EntryManager {
    pub fn new(
        symbols: Vec<SymbolEntryConfig>,
        global: GlobalEntryConfig,
        indicator_engine: IndicatorEngine,
        option_picker: OptionPicker,
        mode: Mode,
    ) -> Self {
        Self { symbols, global, indicator_engine, option_picker, mode }
    }

    /// Run one decision tick across every configured symbol, in priority
    /// (declaration) order, so ties on a tick-competing resource resolve
    /// deterministically (spec §4.13 edge case).
    #[allow(clippy::too_many_arguments)]
    pub async fn run_tick(
        &self,
        session_guard: &SessionGuard,
        session_pnl: &SessionPnl,
        candles: &dyn CandleProvider,
        tick_cache: &TickCache,
        positions: &PositionTracker,
        broker: &dyn Broker,
        balance: &dyn BalanceProvider,
        atomic_trade: &AtomicTrade,
        ws_manager: &Arc<WSManager>,
        today: NaiveDate,
    ) {
        // 1. SessionGuard must be ok before any entry is attempted.
        if !session_guard.check(session_pnl).is_ok() {
            return;
        }

        // 3. Portfolio-wide concurrency cap.
        if positions.list_open().len() >= self.global.max_concurrent_positions {
            return;
        }

        let mut opened_this_tick: HashSet<(String, Side)> = HashSet::new();

        for symbol_config in &self.symbols {
            if let Err(e) = self
                .try_enter(
                    symbol_config,
                    candles,
                    tick_cache,
                    positions,
                    broker,
                    balance,
                    atomic_trade,
                    ws_manager,
                    today,
                    &mut opened_this_tick,
                )
                .await
            {
                warn!(symbol = %symbol_config.symbol, error = %e, "entry evaluation failed, continuing to next symbol");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_enter(
        &self,
        cfg: &SymbolEntryConfig,
        candles: &dyn CandleProvider,
        tick_cache: &TickCache,
        positions: &PositionTracker,
        broker: &dyn Broker,
        balance: &dyn BalanceProvider,
        atomic_trade: &AtomicTrade,
        ws_manager: &Arc<WSManager>,
        today: NaiveDate,
        opened_this_tick: &mut HashSet<(String, Side)>,
    ) -> anyhow::Result<()> {
        // 4. Primary/secondary candle series.
        let Some(primary) = candles.primary(&cfg.symbol) else { return Ok(()) };
        let secondary = candles.secondary(&cfg.symbol);

        // 5. Indicator verdict; skip unless it says to proceed.
        let signal = self.indicator_engine.evaluate(&primary, secondary.as_ref());
        if !signal.proceed {
            return Ok(());
        }

        let Some(right) = signal.direction.to_right() else { return Ok(()) };
        let side_key = (cfg.symbol.clone(), Side::Buy);

        // 6. Option selection, needed up front so the concurrency cap below
        // can recognize "this symbol's instruments" rather than "this
        // segment's instruments" — two symbols can share an options segment.
        let Some(spot) = tick_cache.ltp(&cfg.idx_segment, cfg.idx_security_id) else { return Ok(()) };
        let Some(pick) = self.option_picker.pick(&cfg.symbol, spot, cfg.strike_step, cfg.opt_segment.clone(), today, cfg.expiry_weekday, self.mode) else {
            return Ok(());
        };
        let atm = OptionPicker::nearest_strike(spot, cfg.strike_step);
        let security_id = match right {
            crate::types::Right::Call => pick.ce_sid.get(&atm).copied(),
            crate::types::Right::Put => pick.pe_sid.get(&atm).copied(),
        };
        let Some(security_id) = security_id else { return Ok(()) };

        // 7. Per-symbol-per-direction concurrency cap, including same-tick
        // entries already opened earlier in this loop. Scoped to this
        // symbol's own option chain, not the whole segment.
        let symbol_sids: std::collections::HashSet<SecurityId> =
            pick.ce_sid.values().chain(pick.pe_sid.values()).copied().collect();
        let already_open = positions
            .list_open()
            .iter()
            .filter(|p| symbol_sids.contains(&p.security_id))
            .count();
        if already_open >= self.global.per_symbol_direction_cap || opened_this_tick.contains(&side_key) {
            return Ok(());
        }

        // 8. Premium lookup; skip (STALE_PRICE) if missing/stale.
        let Some(premium) = tick_cache.ltp(&pick.segment, security_id) else { return Ok(()) };
        if !tick_cache.fresh(&pick.segment, security_id, std::time::Duration::from_secs(5)) {
            return Ok(());
        }

        // 9. Sizing; skip if zero lots.
        let available = balance.available_balance().await;
        let lots = QuantitySizer::lots(
            available,
            self.global.allocation_pct,
            premium,
            self.global.slippage_buffer_pct,
            cfg.lot_size,
            self.global.max_lots_per_trade,
            cfg.qty_multiplier,
        );
        if lots == 0 {
            return Ok(());
        }
        let qty = lots * cfg.lot_size.unwrap_or(0);
        if qty == 0 {
            return Ok(());
        }

        // 10. Atomic buy.
        let fill = broker.buy_market(pick.segment.clone(), security_id, qty, self.global.fee_per_lot).await;
        if !fill.ok {
            warn!(symbol = %cfg.symbol, error = ?fill.error, "entry order rejected");
            return Ok(());
        }

        let outcome = atomic_trade
            .buy(pick.segment.clone(), security_id, Side::Buy, fill.filled_qty, fill.filled_price, self.global.fee_per_lot, None)
            .await;

        if !outcome.ok {
            warn!(symbol = %cfg.symbol, reason = ?outcome.reason, "entry bookkeeping rejected after fill");
            return Ok(());
        }

        // Seed risk fields on the freshly opened position.
        let sl = fill.filled_price.mul_scalar(Decimal::ONE - self.global.sl_pct).unwrap_or(fill.filled_price);
        let tp = fill.filled_price.mul_scalar(Decimal::ONE + self.global.tp_pct).unwrap_or(fill.filled_price);
        positions.update_risk_fields(&pick.segment, security_id, Side::Buy, |p| {
            p.peak_price = fill.filled_price;
            p.stop_loss = sl;
            p.take_profit = tp;
            p.trailing_stop = None;
        });

        // Register the instrument with WSManager so its ticks keep flowing.
        ws_manager.add_position(pick.segment.clone(), security_id);

        opened_this_tick.insert(side_key);
        info!(symbol = %cfg.symbol, security_id = %security_id, qty, price = %fill.filled_price, "entry opened");

        Ok(())
    }
}
