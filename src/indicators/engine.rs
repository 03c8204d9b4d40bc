// =============================================================================
// IndicatorEngine — composite trend verdict from one or two candle series
// =============================================================================
//
// Grounded on `strategy.rs::StrategyEngine::evaluate_symbol`'s pipeline shape
// (gather candles -> compute indicators -> combine into a single verdict),
// narrowed to the two-composite contract the data model actually needs:
// Basic (EMA crossover + RSI confirm) and Enhanced (+ ADX gate + Supertrend
// confirm). `proceed` requires primary/secondary timeframe agreement.
// =============================================================================

use crate::types::{CandleSeries, Direction};

use super::adx::calculate_adx;
use super::ema::calculate_ema;
use super::rsi::calculate_rsi;
use super::supertrend::{calculate_supertrend, SupertrendDirection};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signal {
    pub direction: Direction,
    pub strength: f64,
    pub adx: f64,
    pub proceed: bool,
}

impl Signal {
    fn none() -> Self {
        Self { direction: Direction::None, strength: 0.0, adx: 0.0, proceed: false }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Composite {
    /// EMA-fast/EMA-slow crossover confirmed by RSI above/below a threshold.
    Basic,
    /// Basic plus ADX gating and a Supertrend confirmation.
    Enhanced,
}

#[derive(Debug, Clone, Copy)]
pub struct IndicatorParams {
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub rsi_period: usize,
    pub rsi_bull_floor: f64,
    pub rsi_bear_ceiling: f64,
    pub adx_period: usize,
    pub min_adx_primary: f64,
    pub min_adx_secondary: f64,
    pub supertrend_period: usize,
    pub supertrend_multiplier: f64,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            ema_fast: 9,
            ema_slow: 21,
            rsi_period: 14,
            rsi_bull_floor: 55.0,
            rsi_bear_ceiling: 45.0,
            adx_period: 14,
            min_adx_primary: 20.0,
            min_adx_secondary: 18.0,
            supertrend_period: 10,
            supertrend_multiplier: 3.0,
        }
    }
}

pub struct IndicatorEngine {
    params: IndicatorParams,
    composite: Composite,
}

impl IndicatorEngine {
    pub fn new(params: IndicatorParams, composite: Composite) -> Self {
        Self { params, composite }
    }

    /// One timeframe's directional read: EMA crossover confirmed by RSI.
    /// Returns `None` when the series is too short for the largest period
    /// the composite requires.
    fn timeframe_signal(&self, series: &CandleSeries, require_adx: bool) -> Option<(Direction, f64, f64)> {
        let closes = series.closes();
        let needed = self.params.ema_slow.max(self.params.rsi_period + 1);
        if closes.len() < needed {
            return None;
        }

        let ema_fast = calculate_ema(&closes, self.params.ema_fast);
        let ema_slow = calculate_ema(&closes, self.params.ema_slow);
        let rsi = calculate_rsi(&closes, self.params.rsi_period);

        let fast = *ema_fast.last()?;
        let slow = *ema_slow.last()?;
        let rsi_val = *rsi.last()?;

        let bullish = fast > slow && rsi_val >= self.params.rsi_bull_floor;
        let bearish = fast < slow && rsi_val <= self.params.rsi_bear_ceiling;

        let direction = if bullish {
            Direction::Bullish
        } else if bearish {
            Direction::Bearish
        } else {
            Direction::None
        };

        let adx = if require_adx || matches!(self.composite, Composite::Enhanced) {
            if series.len() < self.params.adx_period * 2 + 1 {
                return None;
            }
            calculate_adx(&series.candles, self.params.adx_period).unwrap_or(0.0)
        } else {
            0.0
        };

        let strength = if slow.abs() > f64::EPSILON { (fast - slow).abs() / slow.abs() } else { 0.0 };
        Some((direction, strength, adx))
    }

    fn supertrend_confirms(&self, series: &CandleSeries, direction: Direction) -> bool {
        match calculate_supertrend(&series.candles, self.params.supertrend_period, self.params.supertrend_multiplier) {
            Some(result) => match direction {
                Direction::Bullish => result.direction == SupertrendDirection::Up,
                Direction::Bearish => result.direction == SupertrendDirection::Down,
                Direction::None => false,
            },
            None => false,
        }
    }

    /// `evaluate(series_primary, series_secondary?) -> Signal`, per the
    /// composite configured on this engine.
    pub fn evaluate(&self, primary: &CandleSeries, secondary: Option<&CandleSeries>) -> Signal {
        let Some((primary_dir, strength, primary_adx)) = self.timeframe_signal(primary, true) else {
            return Signal::none();
        };

        if primary_dir == Direction::None {
            return Signal::none();
        }

        if let Composite::Enhanced = self.composite {
            if primary_adx < self.params.min_adx_primary {
                return Signal { direction: primary_dir, strength, adx: primary_adx, proceed: false };
            }
            if !self.supertrend_confirms(primary, primary_dir) {
                return Signal { direction: primary_dir, strength, adx: primary_adx, proceed: false };
            }
        }

        let proceed = match secondary {
            Some(secondary_series) => match self.timeframe_signal(secondary_series, true) {
                Some((secondary_dir, _, secondary_adx)) => {
                    let agrees = secondary_dir == primary_dir;
                    let adx_ok = match self.composite {
                        Composite::Enhanced => secondary_adx >= self.params.min_adx_secondary,
                        Composite::Basic => true,
                    };
                    agrees && adx_ok
                }
                None => false,
            },
            None => true,
        };

        Signal { direction: primary_dir, strength, adx: primary_adx, proceed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Candle;

    fn trending_series(n: usize, step: f64, start: f64) -> CandleSeries {
        let candles = (0..n)
            .map(|i| {
                let base = start + i as f64 * step;
                Candle {
                    open_time: i as i64,
                    close_time: i as i64 + 1,
                    open: base,
                    high: base + step.abs().max(0.5),
                    low: base - step.abs().max(0.5),
                    close: base,
                    volume: 100.0,
                    is_closed: true,
                }
            })
            .collect();
        CandleSeries { candles }
    }

    #[test]
    fn insufficient_data_returns_none_direction() {
        let engine = IndicatorEngine::new(IndicatorParams::default(), Composite::Basic);
        let series = trending_series(5, 1.0, 100.0);
        let signal = engine.evaluate(&series, None);
        assert_eq!(signal.direction, Direction::None);
        assert!(!signal.proceed);
    }

    #[test]
    fn basic_composite_proceeds_without_secondary() {
        let engine = IndicatorEngine::new(IndicatorParams::default(), Composite::Basic);
        let series = trending_series(60, 2.0, 100.0);
        let signal = engine.evaluate(&series, None);
        assert_eq!(signal.direction, Direction::Bullish);
        assert!(signal.proceed);
    }

    #[test]
    fn basic_composite_requires_secondary_agreement() {
        let engine = IndicatorEngine::new(IndicatorParams::default(), Composite::Basic);
        let primary = trending_series(60, 2.0, 100.0);
        let secondary = trending_series(60, -2.0, 300.0);
        let signal = engine.evaluate(&primary, Some(&secondary));
        assert!(!signal.proceed);
    }

    #[test]
    fn enhanced_composite_gates_on_adx_and_supertrend() {
        let engine = IndicatorEngine::new(IndicatorParams::default(), Composite::Enhanced);
        let series = trending_series(80, 3.0, 100.0);
        let signal = engine.evaluate(&series, None);
        assert_eq!(signal.direction, Direction::Bullish);
        assert!(signal.adx > 0.0);
        assert!(signal.proceed);
    }

    #[test]
    fn flat_market_yields_no_proceed() {
        let engine = IndicatorEngine::new(IndicatorParams::default(), Composite::Basic);
        let series = trending_series(60, 0.0, 100.0);
        let signal = engine.evaluate(&series, None);
        assert!(!signal.proceed);
    }
}
