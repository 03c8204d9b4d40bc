// =============================================================================
// scalper-engine — Main Entry Point
// =============================================================================
//
// Wires every long-lived collaborator and hands them to `Supervisor`, which
// owns the decision-tick loop from there. The engine starts in Paper mode
// for safety; Live mode requires an explicit `SCALPER_MODE=live` override.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod atomic_trade;
mod balance;
mod broker;
mod candle_feed;
mod config;
mod entry_manager;
mod error;
mod exit_manager;
mod indicators;
mod instrument;
mod money;
mod option_picker;
mod position;
mod quantity_sizer;
mod session_guard;
mod store;
mod supervisor;
mod tick_cache;
mod types;
mod ws_manager;

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;
use parking_lot::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::atomic_trade::AtomicTrade;
use crate::balance::{BalanceProvider, LiveBalance, SimulatedBalance};
use crate::broker::{Broker, LiveBroker, PaperBroker};
use crate::candle_feed::{CandleFeed, CandleFeedTarget};
use crate::config::RuntimeConfig;
use crate::entry_manager::{CandleProvider, GlobalEntryConfig, SymbolEntryConfig};
use crate::exit_manager::ExitConfig;
use crate::indicators::{Composite, IndicatorParams};
use crate::instrument::{CsvInstrumentResolver, InstrumentResolver, StaticInstrumentResolver};
use crate::money::Money;
use crate::position::PositionTracker;
use crate::session_guard::{MarketWindow, SessionGuard, SessionGuardConfig};
use crate::store::null_store::NullStore;
use crate::store::redis_store::RedisStore;
use crate::store::DurableStore;
use crate::supervisor::{Supervisor, SupervisorConfig};
use crate::tick_cache::TickCache;
use crate::types::Mode;
use crate::ws_manager::{WSManager, WsConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("scalper-engine starting up");

    // ── 1. Configuration ─────────────────────────────────────────────────
    let config_path = std::env::var("SCALPER_CONFIG_PATH").unwrap_or_else(|_| "runtime_config.json".into());
    let mut runtime_config = RuntimeConfig::load(&config_path);

    // SAFETY: force Paper mode on startup unless explicitly overridden.
    runtime_config.mode = Mode::Paper;
    if let Ok(mode) = std::env::var("SCALPER_MODE") {
        if mode.eq_ignore_ascii_case("live") {
            runtime_config.mode = Mode::Live;
        }
    }

    if let Ok(syms) = std::env::var("SCALPER_SYMBOLS") {
        runtime_config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    info!(symbols = ?runtime_config.symbols, mode = %runtime_config.mode, "configured");

    // ── 2. Instrument resolver ───────────────────────────────────────────
    let resolver: Arc<dyn InstrumentResolver> = match std::env::var("SCALPER_INSTRUMENTS_CSV") {
        Ok(path) => match CsvInstrumentResolver::load(&path) {
            Ok(r) => Arc::new(r),
            Err(e) => {
                warn!(error = %e, path, "failed to load instrument CSV, falling back to an empty resolver");
                Arc::new(StaticInstrumentResolver::new())
            }
        },
        Err(_) => Arc::new(StaticInstrumentResolver::new()),
    };

    // ── 3. Durable store ──────────────────────────────────────────────────
    let store: Arc<dyn DurableStore> = match std::env::var("SCALPER_REDIS_URL") {
        Ok(url) => match RedisStore::connect(&url, "scalper") {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!(error = %e, "failed to connect to redis, falling back to an in-memory store");
                Arc::new(NullStore::new())
            }
        },
        Err(_) => {
            warn!("SCALPER_REDIS_URL not set, using an in-memory store (no restart durability)");
            Arc::new(NullStore::new())
        }
    };

    // ── 4. Broker, balance, positions, tick cache ────────────────────────
    let tick_cache = Arc::new(TickCache::new(Some(store.clone())));
    let positions = Arc::new(PositionTracker::new());

    let broker: Arc<dyn Broker> = if runtime_config.mode == Mode::Live {
        let base_url = std::env::var("SCALPER_BROKER_URL").unwrap_or_else(|_| "https://api.broker.invalid".into());
        let client_id = std::env::var("SCALPER_CLIENT_ID").unwrap_or_default();
        let access_token = std::env::var("SCALPER_ACCESS_TOKEN").unwrap_or_default();
        Arc::new(LiveBroker::new(base_url, client_id, access_token))
    } else {
        Arc::new(PaperBroker::new(tick_cache.clone()))
    };

    let balance: Arc<dyn BalanceProvider> = if runtime_config.mode == Mode::Live {
        Arc::new(LiveBalance::new(broker.clone()))
    } else {
        Arc::new(SimulatedBalance::new(runtime_config.starting_balance()))
    };

    // ── 5. Session guard ──────────────────────────────────────────────────
    let market_open = NaiveTime::from_hms_opt(9, 15, 0).unwrap();
    let market_close = NaiveTime::from_hms_opt(15, 30, 0).unwrap();
    let session_guard = Arc::new(SessionGuard::new(SessionGuardConfig {
        market_window: MarketWindow {
            open: market_open,
            close: market_close,
            grace: chrono::Duration::minutes(5),
            tz_offset: MarketWindow::ist(),
        },
        max_day_loss: runtime_config.max_day_loss(),
        stale_threshold: Duration::from_secs(30),
    }));
    session_guard.record_heartbeat();

    // ── 6. WebSocket manager ──────────────────────────────────────────────
    let ws_url = std::env::var("SCALPER_WS_URL").unwrap_or_else(|_| "wss://broker.invalid/feed".into());
    let ws_manager = WSManager::new(
        ws_url,
        tick_cache.clone(),
        WsConfig {
            heartbeat_interval: runtime_config.heartbeat_interval(),
            max_reconnect_attempts: runtime_config.websocket.max_reconnect_attempts,
            base_reconnect_delay: runtime_config.base_reconnect_delay(),
            max_reconnect_delay: runtime_config.max_reconnect_delay(),
            dedup_window: 0,
        },
    );
    for cfg in runtime_config.symbol_configs.values() {
        ws_manager.add_baseline(cfg.seg_idx.clone(), crate::types::SecurityId(cfg.idx_sid));
    }
    ws_manager.clone().run();

    // ── 7. Candle feed ────────────────────────────────────────────────────
    let candle_feed = Arc::new(CandleFeed::new());
    let candle_targets: Vec<CandleFeedTarget> = runtime_config
        .symbol_configs
        .iter()
        .map(|(symbol, cfg)| CandleFeedTarget {
            symbol: symbol.clone(),
            segment: cfg.seg_idx.clone(),
            security_id: crate::types::SecurityId(cfg.idx_sid),
            primary_interval_secs: 180,
            secondary_interval_secs: Some(900),
        })
        .collect();
    candle_feed.clone().spawn_poller(tick_cache.clone(), candle_targets, Duration::from_secs(5));
    let candles: Arc<dyn CandleProvider> = candle_feed;

    // ── 8. Supervisor ─────────────────────────────────────────────────────
    let symbols: Vec<SymbolEntryConfig> = runtime_config
        .symbol_configs
        .iter()
        .map(|(symbol, cfg)| SymbolEntryConfig {
            symbol: symbol.clone(),
            idx_segment: cfg.seg_idx.clone(),
            idx_security_id: crate::types::SecurityId(cfg.idx_sid),
            opt_segment: cfg.seg_opt.clone(),
            strike_step: cfg.strike_step,
            lot_size: cfg.lot_size,
            qty_multiplier: cfg.qty_multiplier,
            expiry_weekday: cfg.expiry_wday,
        })
        .collect();

    let fee_per_lot = runtime_config.fee_per_lot();
    let starting_balance = runtime_config.starting_balance();
    let session_id = uuid::Uuid::new_v4().to_string();

    let supervisor_config = SupervisorConfig {
        symbols,
        global_entry: GlobalEntryConfig {
            allocation_pct: runtime_config.global.allocation_pct,
            slippage_buffer_pct: runtime_config.global.slippage_buffer_pct,
            max_lots_per_trade: runtime_config.global.max_lots_per_trade,
            max_concurrent_positions: 5,
            sl_pct: runtime_config.global.sl_pct,
            tp_pct: runtime_config.global.tp_pct,
            fee_per_lot,
            per_symbol_direction_cap: 1,
        },
        exit: ExitConfig {
            emergency_floor_rupees: runtime_config.emergency_floor(),
            breakeven_threshold_pct: runtime_config.global.breakeven_threshold_pct,
            trail_pct: runtime_config.global.trail_pct,
            rupee_step: Some(Money::from_decimal(runtime_config.global.rupee_step)),
            fee_per_lot,
            idempotency_window: Duration::from_secs(10),
        },
        indicator_params: IndicatorParams::default(),
        composite: Composite::Enhanced,
        mode: runtime_config.mode,
        session_id,
        decision_interval: runtime_config.decision_interval(),
        fee_per_lot,
        starting_balance,
        config_path: config_path.clone(),
    };

    let supervisor = Arc::new(Supervisor::new(
        supervisor_config,
        runtime_config.clone(),
        resolver,
        tick_cache,
        positions,
        balance,
        store,
        broker,
        session_guard,
        ws_manager,
        candles,
    ));

    // ── 9. API server ─────────────────────────────────────────────────────
    let app_state = Arc::new(AppState::new(supervisor.clone(), Arc::new(RwLock::new(runtime_config)), config_path));
    let bind_addr = std::env::var("SCALPER_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let router = api::rest::router(app_state);

    let api_task = tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, router).await?;
        Ok::<(), anyhow::Error>(())
    });

    // ── 10. Run until shutdown ────────────────────────────────────────────
    tokio::select! {
        res = supervisor.run() => {
            res?;
        }
        res = api_task => {
            res??;
        }
    }

    info!("scalper-engine shut down cleanly");
    Ok(())
}
