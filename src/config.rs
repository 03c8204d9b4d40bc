// =============================================================================
// RuntimeConfig — serde-default configuration with atomic save
// =============================================================================
//
// Grounded on `runtime_config.rs::RuntimeConfig`: every field carries a
// `#[serde(default = "...")]` so a config file missing a key still loads
// with a sane value, and `save()` writes through a temp file + rename so a
// crash mid-write never corrupts the on-disk config. The field set itself
// follows spec §6's configuration key table exactly instead of the
// teacher's crypto-specific feature-flag/ATR-multiplier fields.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use chrono::Weekday;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::money::Money;
use crate::types::{Mode, SecurityId};

fn default_mode() -> Mode {
    Mode::Paper
}
fn default_decision_interval_secs() -> u64 {
    10
}
fn default_min_profit_target() -> Decimal {
    Decimal::new(500, 2) // 5.00
}
fn default_max_day_loss() -> Decimal {
    Decimal::new(200000, 2) // 2000.00
}
fn default_charge_per_order() -> Decimal {
    Decimal::new(2000, 2) // 20.00
}
fn default_allocation_pct() -> Decimal {
    Decimal::new(200, 1) // 20.0
}
fn default_slippage_buffer_pct() -> Decimal {
    Decimal::ONE
}
fn default_max_lots_per_trade() -> i64 {
    10
}
fn default_tp_pct() -> Decimal {
    Decimal::new(5, 2) // 0.05
}
fn default_sl_pct() -> Decimal {
    Decimal::new(3, 2) // 0.03
}
fn default_trail_pct() -> Decimal {
    Decimal::new(2, 2) // 0.02
}
fn default_breakeven_threshold_pct() -> Decimal {
    Decimal::new(1, 2) // 0.01
}
fn default_rupee_step() -> Decimal {
    Decimal::new(5, 1) // 0.5
}
fn default_emergency_floor_rupees() -> Decimal {
    Decimal::new(500000, 2) // 5000.00
}
fn default_starting_balance() -> Decimal {
    Decimal::new(10000000, 2) // 100000.00
}
fn default_heartbeat_interval_secs() -> u64 {
    15
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_base_reconnect_delay_ms() -> u64 {
    500
}
fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}
fn default_strike_step() -> i64 {
    50
}
fn default_qty_multiplier() -> i64 {
    10
}
fn default_expiry_weekday() -> Weekday {
    Weekday::Thu
}

/// Global risk, sizing, and exit-ladder parameters shared across symbols.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_min_profit_target")]
    pub min_profit_target: Decimal,
    #[serde(default = "default_max_day_loss")]
    pub max_day_loss: Decimal,
    #[serde(default = "default_charge_per_order")]
    pub charge_per_order: Decimal,
    #[serde(default = "default_allocation_pct")]
    pub allocation_pct: Decimal,
    #[serde(default = "default_slippage_buffer_pct")]
    pub slippage_buffer_pct: Decimal,
    #[serde(default = "default_max_lots_per_trade")]
    pub max_lots_per_trade: i64,
    #[serde(default = "default_decision_interval_secs")]
    pub decision_interval_secs: u64,
    #[serde(default = "default_tp_pct")]
    pub tp_pct: Decimal,
    #[serde(default = "default_sl_pct")]
    pub sl_pct: Decimal,
    #[serde(default = "default_trail_pct")]
    pub trail_pct: Decimal,
    #[serde(default = "default_breakeven_threshold_pct")]
    pub breakeven_threshold_pct: Decimal,
    #[serde(default = "default_rupee_step")]
    pub rupee_step: Decimal,
    #[serde(default = "default_emergency_floor_rupees")]
    pub emergency_floor_rupees: Decimal,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            min_profit_target: default_min_profit_target(),
            max_day_loss: default_max_day_loss(),
            charge_per_order: default_charge_per_order(),
            allocation_pct: default_allocation_pct(),
            slippage_buffer_pct: default_slippage_buffer_pct(),
            max_lots_per_trade: default_max_lots_per_trade(),
            decision_interval_secs: default_decision_interval_secs(),
            tp_pct: default_tp_pct(),
            sl_pct: default_sl_pct(),
            trail_pct: default_trail_pct(),
            breakeven_threshold_pct: default_breakeven_threshold_pct(),
            rupee_step: default_rupee_step(),
            emergency_floor_rupees: default_emergency_floor_rupees(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_starting_balance")]
    pub starting_balance: Decimal,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self { starting_balance: default_starting_balance() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_base_reconnect_delay_ms")]
    pub base_reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            base_reconnect_delay_ms: default_base_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
        }
    }
}

/// Per-symbol instrument wiring: `SYMBOLS.<sym>.*` in spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub idx_sid: i64,
    pub seg_idx: String,
    pub seg_opt: String,
    #[serde(default = "default_strike_step")]
    pub strike_step: i64,
    #[serde(default)]
    pub lot_size: Option<i64>,
    #[serde(default = "default_qty_multiplier")]
    pub qty_multiplier: i64,
    #[serde(default = "default_expiry_weekday")]
    pub expiry_wday: Weekday,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub paper: PaperConfig,
    #[serde(default)]
    pub websocket: WebsocketConfig,
    #[serde(default, rename = "SYMBOLS")]
    pub symbol_configs: HashMap<String, SymbolConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            mode: default_mode(),
            global: GlobalConfig::default(),
            paper: PaperConfig::default(),
            websocket: WebsocketConfig::default(),
            symbol_configs: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load from `path`, falling back to defaults for anything missing or
    /// for a wholly absent/unreadable file.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "runtime config loaded");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "runtime config parse failed, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no runtime config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Atomic tmp+rename save, identical discipline to the teacher's
    /// `RuntimeConfig::save`: a crash mid-write leaves the prior file intact.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, path)?;
        info!(path = %path.display(), "runtime config saved");
        Ok(())
    }

    pub fn emergency_floor(&self) -> Money {
        Money::from_decimal(self.global.emergency_floor_rupees)
    }

    pub fn max_day_loss(&self) -> Money {
        Money::from_decimal(self.global.max_day_loss)
    }

    pub fn fee_per_lot(&self) -> Money {
        Money::from_decimal(self.global.charge_per_order)
    }

    pub fn starting_balance(&self) -> Money {
        Money::from_decimal(self.paper.starting_balance)
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.websocket.heartbeat_interval_secs)
    }

    pub fn base_reconnect_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.websocket.base_reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.websocket.max_reconnect_delay_ms)
    }

    pub fn decision_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.global.decision_interval_secs)
    }

    pub fn idx_security_id(&self, symbol: &str) -> Option<SecurityId> {
        self.symbol_configs.get(symbol).map(|s| SecurityId(s.idx_sid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.mode, Mode::Paper);
        assert!(config.global.max_lots_per_trade > 0);
        assert_eq!(config.websocket.max_reconnect_attempts, 10);
    }

    #[test]
    fn empty_json_uses_defaults() {
        let config: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.global.decision_interval_secs, 10);
        assert_eq!(config.paper.starting_balance, default_starting_balance());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"symbols": ["NIFTY"], "global": {"max_day_loss": "500.00"}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.symbols, vec!["NIFTY".to_string()]);
        assert_eq!(config.global.max_day_loss, Decimal::new(50000, 2));
        assert_eq!(config.global.allocation_pct, default_allocation_pct());
    }

    #[test]
    fn roundtrip_save_and_load() {
        let config = RuntimeConfig::default();
        let dir = std::env::temp_dir().join(format!("scalper-engine-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime_config.json");
        config.save(&path).unwrap();
        let loaded = RuntimeConfig::load(&path);
        assert_eq!(loaded.global.max_day_loss, config.global.max_day_loss);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let loaded = RuntimeConfig::load("/nonexistent/path/runtime_config.json");
        assert_eq!(loaded.global.decision_interval_secs, default_decision_interval_secs());
    }
}
