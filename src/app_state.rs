// =============================================================================
// AppState — shared context for the read-only API layer
// =============================================================================
//
// Trimmed from the teacher's `AppState` (one Arc-wrapped struct threaded
// through Axum's `with_state`, carrying a dashboard-sized snapshot of every
// subsystem — regime, scoring, VPIN, futures intel, feature flags) down to
// what a single-broker options scalper's operator surface actually needs:
// balance, open positions, orders, and the running session report, all read
// off the `Supervisor` and its collaborators rather than duplicated into a
// second copy of the state.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::balance::BalanceSnapshot;
use crate::config::RuntimeConfig;
use crate::position::Position;
use crate::supervisor::Supervisor;
use crate::types::{Order, SessionPnl, SessionReport};

/// Central application state shared across API handlers via `Arc<AppState>`.
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub config_path: String,

    /// Monotonically increasing version counter, bumped on admin mutations
    /// (the kill switch). Exposed for cheap polling clients.
    state_version: AtomicU64,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(supervisor: Arc<Supervisor>, runtime_config: Arc<RwLock<RuntimeConfig>>, config_path: String) -> Self {
        Self {
            supervisor,
            runtime_config,
            config_path,
            state_version: AtomicU64::new(1),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.supervisor.positions().list_open()
    }

    pub fn closed_positions(&self) -> Vec<Position> {
        self.supervisor
            .positions()
            .list_all()
            .into_iter()
            .filter(|p| p.sell_qty > 0)
            .collect()
    }

    pub async fn balance_snapshot(&self) -> BalanceSnapshot {
        self.supervisor.balance().snapshot().await
    }

    pub fn session_pnl(&self) -> SessionPnl {
        self.supervisor.session_pnl()
    }

    pub async fn session_report(&self) -> SessionReport {
        self.supervisor.session_report().await
    }

    pub async fn recent_orders(&self, limit: usize) -> Vec<Order> {
        self.supervisor.recent_orders(limit).await
    }

    /// Admin kill switch: trip the panic flag and liquidate every open
    /// position immediately, ahead of the next scheduled decision tick.
    pub async fn trigger_panic(&self) {
        self.supervisor.panic_liquidate().await;
        self.increment_version();
    }

    /// Save the current runtime config to `config_path` (best-effort, caller
    /// logs failures).
    pub fn save_runtime_config(&self) -> anyhow::Result<()> {
        self.runtime_config.read().save(&self.config_path)
    }
}
