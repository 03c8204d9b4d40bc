// =============================================================================
// Supertrend — ATR-banded trend-following overlay
// =============================================================================
//
// Written in the same pure-function idiom as `atr.rs`: one public entry
// point over a candle slice, `Option`-typed on insufficient data, no hidden
// state between calls.
//
//   basic_upper = ((high + low) / 2) + multiplier * ATR
//   basic_lower = ((high + low) / 2) - multiplier * ATR
//
// The final bands only ever tighten toward price — the upper band can only
// fall, the lower band can only rise — until price closes through the band,
// at which point the trend flips and the opposite band reseeds.
// =============================================================================

use crate::types::Candle;

use super::atr::calculate_atr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupertrendDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy)]
pub struct SupertrendResult {
    pub value: f64,
    pub direction: SupertrendDirection,
}

/// Compute the most recent Supertrend value and direction.
///
/// Returns `None` when ATR cannot be computed (insufficient data) or when any
/// intermediate value is non-finite.
pub fn calculate_supertrend(candles: &[Candle], period: usize, multiplier: f64) -> Option<SupertrendResult> {
    if candles.len() < period + 2 {
        return None;
    }

    let mut direction = SupertrendDirection::Up;
    let mut final_upper = f64::MAX;
    let mut final_lower = f64::MIN;
    let mut value = 0.0_f64;

    for i in period..candles.len() {
        let window = &candles[..=i];
        let atr = calculate_atr(window, period)?;
        let candle = &candles[i];
        let hl2 = (candle.high + candle.low) / 2.0;
        let basic_upper = hl2 + multiplier * atr;
        let basic_lower = hl2 - multiplier * atr;

        let prev_close = candles[i - 1].close;

        final_upper = if basic_upper < final_upper || prev_close > final_upper {
            basic_upper
        } else {
            final_upper
        };
        final_lower = if basic_lower > final_lower || prev_close < final_lower {
            basic_lower
        } else {
            final_lower
        };

        direction = match direction {
            SupertrendDirection::Up if candle.close < final_lower => SupertrendDirection::Down,
            SupertrendDirection::Down if candle.close > final_upper => SupertrendDirection::Up,
            other => other,
        };

        value = match direction {
            SupertrendDirection::Up => final_lower,
            SupertrendDirection::Down => final_upper,
        };

        if !value.is_finite() {
            return None;
        }
    }

    Some(SupertrendResult { value, direction })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle { open_time: 0, close_time: 0, open, high, low, close, volume: 1.0, is_closed: true }
    }

    #[test]
    fn insufficient_data_returns_none() {
        let candles = vec![candle(100.0, 101.0, 99.0, 100.0); 5];
        assert!(calculate_supertrend(&candles, 10, 3.0).is_none());
    }

    #[test]
    fn strong_uptrend_resolves_to_up_direction() {
        let candles: Vec<Candle> = (0..40)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(base, base + 1.5, base - 0.5, base + 1.0)
            })
            .collect();
        let result = calculate_supertrend(&candles, 10, 3.0).unwrap();
        assert_eq!(result.direction, SupertrendDirection::Up);
        assert!(result.value < candles.last().unwrap().close);
    }

    #[test]
    fn strong_downtrend_resolves_to_down_direction() {
        let candles: Vec<Candle> = (0..40)
            .map(|i| {
                let base = 300.0 - i as f64 * 2.0;
                candle(base, base + 0.5, base - 1.5, base - 1.0)
            })
            .collect();
        let result = calculate_supertrend(&candles, 10, 3.0).unwrap();
        assert_eq!(result.direction, SupertrendDirection::Down);
        assert!(result.value > candles.last().unwrap().close);
    }
}
