// =============================================================================
// Supervisor — owns the decision-tick timer and wires every component
// =============================================================================
//
// Grounded on `main.rs`'s task-spawn-and-ctrl_c shape, pulled out of `main`
// into an owned struct: one periodic loop drives exit evaluation then entry
// evaluation every tick, and a separate `ctrl_c` path does a final force-exit
// sweep and persists a session report and the runtime config, mirroring the
// teacher's `state.runtime_config.read().save(...)` shutdown line.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::atomic_trade::AtomicTrade;
use crate::balance::BalanceProvider;
use crate::broker::Broker;
use crate::config::RuntimeConfig;
use crate::entry_manager::{CandleProvider, EntryManager, GlobalEntryConfig, SymbolEntryConfig};
use crate::exit_manager::{ExitConfig, ExitManager};
use crate::indicators::{Composite, IndicatorEngine, IndicatorParams};
use crate::instrument::InstrumentResolver;
use crate::money::Money;
use crate::option_picker::OptionPicker;
use crate::position::PositionTracker;
use crate::session_guard::SessionGuard;
use crate::store::DurableStore;
use crate::tick_cache::TickCache;
use crate::types::{Mode, SecurityId, SessionPnl, SessionReport};
use crate::ws_manager::WSManager;

pub struct SupervisorConfig {
    pub symbols: Vec<SymbolEntryConfig>,
    pub global_entry: GlobalEntryConfig,
    pub exit: ExitConfig,
    pub indicator_params: IndicatorParams,
    pub composite: Composite,
    pub mode: Mode,
    pub session_id: String,
    pub decision_interval: Duration,
    pub fee_per_lot: Money,
    pub starting_balance: Money,
    pub config_path: String,
}

/// Owns the decision-tick loop and every long-lived collaborator it drives.
/// `EntryManager` and `ExitManager` never talk to each other directly; the
/// Supervisor is the only component that sees both each tick.
pub struct Supervisor {
    tick_cache: Arc<TickCache>,
    positions: Arc<PositionTracker>,
    balance: Arc<dyn BalanceProvider>,
    broker: Arc<dyn Broker>,
    atomic_trade: AtomicTrade,
    session_guard: Arc<SessionGuard>,
    entry_manager: EntryManager,
    exit_manager: ExitManager,
    ws_manager: Arc<WSManager>,
    candles: Arc<dyn CandleProvider>,
    entry_symbols: Vec<SymbolEntryConfig>,
    indicator_engine: IndicatorEngine,
    option_picker: OptionPicker,
    session_pnl: parking_lot::RwLock<SessionPnl>,
    peak_total: parking_lot::RwLock<Money>,
    mode: Mode,
    session_id: String,
    decision_interval: Duration,
    fee_per_lot: Money,
    starting_balance: Money,
    config_path: String,
    runtime_config: RuntimeConfig,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: SupervisorConfig,
        runtime_config: RuntimeConfig,
        resolver: Arc<dyn InstrumentResolver>,
        tick_cache: Arc<TickCache>,
        positions: Arc<PositionTracker>,
        balance: Arc<dyn BalanceProvider>,
        store: Arc<dyn DurableStore>,
        broker: Arc<dyn Broker>,
        session_guard: Arc<SessionGuard>,
        ws_manager: Arc<WSManager>,
        candles: Arc<dyn CandleProvider>,
    ) -> Self {
        let atomic_trade = AtomicTrade::new(
            balance.clone(),
            positions.clone(),
            store,
            cfg.session_id.clone(),
            cfg.mode,
        );

        let entry_manager = EntryManager::new(
            cfg.symbols.clone(),
            cfg.global_entry,
            IndicatorEngine::new(cfg.indicator_params, cfg.composite),
            OptionPicker::new(resolver.clone()),
            cfg.mode,
        );
        let exit_manager = ExitManager::new(cfg.exit);

        Self {
            tick_cache,
            positions,
            balance,
            broker,
            atomic_trade,
            session_guard,
            entry_manager,
            exit_manager,
            ws_manager,
            candles,
            entry_symbols: cfg.symbols,
            indicator_engine: IndicatorEngine::new(cfg.indicator_params, cfg.composite),
            option_picker: OptionPicker::new(resolver),
            session_pnl: parking_lot::RwLock::new(SessionPnl::new()),
            peak_total: parking_lot::RwLock::new(Money::zero()),
            mode: cfg.mode,
            session_id: cfg.session_id,
            decision_interval: cfg.decision_interval,
            fee_per_lot: cfg.fee_per_lot,
            starting_balance: cfg.starting_balance,
            config_path: cfg.config_path,
            runtime_config,
        }
    }

    /// Spawns the decision-tick loop and blocks until `ctrl_c`, then runs a
    /// final liquidation sweep and persists the session report and config.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let loop_handle = {
            let sup = self.clone();
            tokio::spawn(async move { sup.decision_loop().await })
        };

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received, sweeping open positions");

        loop_handle.abort();
        self.ws_manager.shutdown();

        self.session_guard.set_panic(true);
        self.session_guard
            .force_exit_all(&self.positions, self.broker.as_ref(), &self.atomic_trade, self.fee_per_lot)
            .await;

        self.refresh_session_pnl().await;
        let report = self.build_session_report().await;
        info!(
            session_id = %report.session_id,
            trades = report.total_trades,
            win_rate = report.win_rate,
            pnl = %report.total_pnl,
            "session report"
        );
        if let Err(e) = self.persist_session_report(&report).await {
            warn!(error = %e, "failed to persist session report");
        }

        if let Err(e) = self.runtime_config.save(&self.config_path) {
            error!(error = %e, "failed to save runtime config on shutdown");
        }

        Ok(())
    }

    async fn decision_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.decision_interval);
        loop {
            interval.tick().await;
            self.run_once().await;
        }
    }

    /// One decision tick: mark-to-market, refresh P&L, run the exit ladder,
    /// then the entry pipeline. Exit-before-entry so a position that both
    /// qualifies for exit and would otherwise free up a concurrency slot
    /// never blocks a fresh entry for a full extra tick.
    async fn run_once(&self) {
        let today = Utc::now().date_naive();

        self.positions.update_unrealized(|seg, id| self.tick_cache.ltp(seg, id));
        self.refresh_session_pnl().await;

        let session_pnl_snapshot = self.session_pnl.read().clone();
        let opposite_signals = self.compute_opposite_signals(today);

        self.exit_manager
            .run_tick(
                &self.positions,
                &self.session_guard,
                &session_pnl_snapshot,
                &opposite_signals,
                self.broker.as_ref(),
                &self.atomic_trade,
            )
            .await;

        self.entry_manager
            .run_tick(
                &self.session_guard,
                &session_pnl_snapshot,
                self.candles.as_ref(),
                &self.tick_cache,
                &self.positions,
                self.broker.as_ref(),
                self.balance.as_ref(),
                &self.atomic_trade,
                &self.ws_manager,
                today,
            )
            .await;

        self.refresh_session_pnl().await;
    }

    /// For every configured symbol, evaluate the current indicator signal and
    /// attribute it to every security id its current option pick covers.
    /// `ExitManager` uses this to fire `SignalInvalidation` when the
    /// direction flips against a held position's right.
    fn compute_opposite_signals(&self, today: chrono::NaiveDate) -> HashMap<SecurityId, crate::types::Direction> {
        let mut map = HashMap::new();
        for cfg in &self.entry_symbols {
            let Some(primary) = self.candles.primary(&cfg.symbol) else { continue };
            let secondary = self.candles.secondary(&cfg.symbol);
            let signal = self.indicator_engine.evaluate(&primary, secondary.as_ref());
            if !signal.proceed {
                continue;
            }
            let Some(spot) = self.tick_cache.ltp(&cfg.idx_segment, cfg.idx_security_id) else { continue };
            let Some(pick) = self.option_picker.pick(
                &cfg.symbol,
                spot,
                cfg.strike_step,
                cfg.opt_segment.clone(),
                today,
                cfg.expiry_weekday,
                self.mode,
            ) else {
                continue;
            };
            for sid in pick.ce_sid.values().chain(pick.pe_sid.values()) {
                map.insert(*sid, signal.direction);
            }
        }
        map
    }

    /// Recompute `realized`/`unrealized`/`fees`/`total` and the running
    /// drawdown watermark. `fees` is derived rather than tracked directly:
    /// a buy's debit and a sell's credit both move money between `available`
    /// and `used` without changing `total`, so `total - starting_balance`
    /// nets out to `realized_pnl - fees_paid`.
    async fn refresh_session_pnl(&self) {
        let realized = self.balance.realized_pnl().await;
        let total_balance = self.balance.total_balance().await;
        let balance_delta = total_balance.sub(self.starting_balance).unwrap_or(Money::zero());
        let fees = realized.sub(balance_delta).unwrap_or(Money::zero());

        let open = self.positions.list_open();
        let unrealized = open
            .iter()
            .fold(Money::zero(), |acc, p| acc.add(p.unrealized_pnl).unwrap_or(acc));

        let total = realized
            .add(unrealized)
            .and_then(|v| v.sub(fees))
            .unwrap_or(Money::zero());

        let mut peak = self.peak_total.write();
        *peak = (*peak).max(total);
        let drawdown = peak.sub(total).unwrap_or(Money::zero());

        let mut pnl = self.session_pnl.write();
        pnl.realized = realized;
        pnl.unrealized = unrealized;
        pnl.fees = fees;
        pnl.total = total;
        pnl.last_update = Utc::now();
        pnl.current_positions = open.len() as u32;
        pnl.max_drawdown = pnl.max_drawdown.max(drawdown);
    }

    /// Tally closed positions into a final report. A position counts as a
    /// completed round trip once any quantity has been sold; win/loss is
    /// the sign of its accumulated `realized_pnl`.
    async fn build_session_report(&self) -> SessionReport {
        let all = self.positions.list_all();
        let mut total_trades = 0u32;
        let mut winning = 0u32;
        let mut losing = 0u32;
        for p in &all {
            if p.sell_qty == 0 {
                continue;
            }
            total_trades += 1;
            if p.realized_pnl.is_negative() {
                losing += 1;
            } else if !p.realized_pnl.is_zero() {
                winning += 1;
            }
        }
        let win_rate = if total_trades > 0 { winning as f64 / total_trades as f64 } else { 0.0 };

        let pnl = self.session_pnl.read().clone();
        let final_balance = self.balance.total_balance().await;
        let now = Utc::now();

        SessionReport {
            session_id: self.session_id.clone(),
            start: pnl.start_time,
            end: now,
            duration_secs: (now - pnl.start_time).num_seconds(),
            total_trades,
            winning,
            losing,
            win_rate,
            total_pnl: pnl.total,
            max_profit: *self.peak_total.read(),
            max_drawdown: pnl.max_drawdown,
            starting_balance: self.starting_balance,
            final_balance,
            failures_by_kind: HashMap::new(),
        }
    }

    async fn persist_session_report(&self, report: &SessionReport) -> anyhow::Result<()> {
        let path = format!("session_report_{}.json", self.session_id);
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    // ── Read-only accessors for the API layer ───────────────────────────

    pub fn positions(&self) -> &Arc<PositionTracker> {
        &self.positions
    }

    pub fn balance(&self) -> &Arc<dyn BalanceProvider> {
        &self.balance
    }

    pub fn session_pnl(&self) -> SessionPnl {
        self.session_pnl.read().clone()
    }

    pub async fn session_report(&self) -> SessionReport {
        self.build_session_report().await
    }

    pub async fn recent_orders(&self, limit: usize) -> Vec<crate::types::Order> {
        self.atomic_trade.recent_orders(limit).await
    }

    /// Trip the panic flag and liquidate every open position immediately,
    /// bypassing the per-tick exit ladder. Driven by the admin kill endpoint.
    pub async fn panic_liquidate(&self) {
        self.session_guard.set_panic(true);
        self.session_guard
            .force_exit_all(&self.positions, self.broker.as_ref(), &self.atomic_trade, self.fee_per_lot)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::SimulatedBalance;
    use crate::broker::PaperBroker;
    use crate::instrument::StaticInstrumentResolver;
    use crate::session_guard::{MarketWindow, SessionGuardConfig};
    use crate::store::null_store::NullStore;
    use crate::types::CandleSeries;
    use rust_decimal_macros::dec;

    struct EmptyCandleProvider;
    impl CandleProvider for EmptyCandleProvider {
        fn primary(&self, _symbol: &str) -> Option<CandleSeries> {
            None
        }
        fn secondary(&self, _symbol: &str) -> Option<CandleSeries> {
            None
        }
    }

    fn always_open_guard() -> Arc<SessionGuard> {
        Arc::new(SessionGuard::new(SessionGuardConfig {
            market_window: MarketWindow {
                open: chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                close: chrono::NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
                grace: chrono::Duration::hours(1),
                tz_offset: MarketWindow::ist(),
            },
            max_day_loss: Money::from_decimal(dec!(1_000_000)),
            stale_threshold: Duration::from_secs(3600),
        }))
    }

    fn build_supervisor() -> Arc<Supervisor> {
        let resolver: Arc<dyn InstrumentResolver> = Arc::new(StaticInstrumentResolver::new());
        let tick_cache = Arc::new(TickCache::new(None));
        let positions = Arc::new(PositionTracker::new());
        let balance: Arc<dyn BalanceProvider> = Arc::new(SimulatedBalance::new(Money::from_decimal(dec!(100_000))));
        let store: Arc<dyn DurableStore> = Arc::new(NullStore::new());
        let broker: Arc<dyn Broker> = Arc::new(PaperBroker::new(tick_cache.clone()));
        let guard = always_open_guard();
        guard.record_heartbeat();
        let ws = WSManager::new("wss://example.invalid", tick_cache.clone(), crate::ws_manager::WsConfig::default());
        let candles: Arc<dyn CandleProvider> = Arc::new(EmptyCandleProvider);

        let cfg = SupervisorConfig {
            symbols: vec![],
            global_entry: GlobalEntryConfig {
                allocation_pct: dec!(20),
                slippage_buffer_pct: dec!(1),
                max_lots_per_trade: 10,
                max_concurrent_positions: 5,
                sl_pct: dec!(0.03),
                tp_pct: dec!(0.05),
                fee_per_lot: Money::from_decimal(dec!(20)),
                per_symbol_direction_cap: 1,
            },
            exit: ExitConfig {
                emergency_floor_rupees: Money::from_decimal(dec!(5000)),
                breakeven_threshold_pct: dec!(0.01),
                trail_pct: dec!(0.02),
                rupee_step: Some(Money::from_decimal(dec!(0.5))),
                fee_per_lot: Money::from_decimal(dec!(20)),
                idempotency_window: Duration::from_secs(10),
            },
            indicator_params: IndicatorParams::default(),
            composite: Composite::Basic,
            mode: Mode::Paper,
            session_id: "sess-test".to_string(),
            decision_interval: Duration::from_secs(10),
            fee_per_lot: Money::from_decimal(dec!(20)),
            starting_balance: Money::from_decimal(dec!(100_000)),
            config_path: "/tmp/scalper-engine-test-runtime-config-unused.json".to_string(),
        };

        Arc::new(Supervisor::new(
            cfg,
            RuntimeConfig::default(),
            resolver,
            tick_cache,
            positions,
            balance,
            store,
            broker,
            guard,
            ws,
            candles,
        ))
    }

    #[tokio::test]
    async fn refresh_session_pnl_matches_zero_when_flat() {
        let sup = build_supervisor();
        sup.refresh_session_pnl().await;
        let pnl = sup.session_pnl.read().clone();
        assert!(pnl.realized.is_zero());
        assert!(pnl.unrealized.is_zero());
        assert!(pnl.total.is_zero());
        assert_eq!(pnl.current_positions, 0);
    }

    #[tokio::test]
    async fn session_report_counts_a_closed_round_trip() {
        let sup = build_supervisor();
        sup.positions.add_fill("NSE_FO".into(), SecurityId(1), crate::types::Side::Buy, 75, Money::from_decimal(dec!(100)), Money::zero());
        sup.positions
            .partial_exit("NSE_FO".into(), SecurityId(1), crate::types::Side::Buy, 75, Money::from_decimal(dec!(130)), Money::from_decimal(dec!(20)))
            .unwrap();

        let report = sup.build_session_report().await;
        assert_eq!(report.total_trades, 1);
        assert_eq!(report.winning, 1);
        assert_eq!(report.losing, 0);
        assert_eq!(report.win_rate, 1.0);
    }

    #[tokio::test]
    async fn opposite_signals_empty_when_no_candles_available() {
        let sup = build_supervisor();
        let today = chrono::NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        let signals = sup.compute_opposite_signals(today);
        assert!(signals.is_empty());
    }
}
