// =============================================================================
// QuantitySizer — lot count from available balance and sizing caps
// =============================================================================
//
// Grounded on `runtime_config.rs::StrategyParams`'s named-percentage-field
// idiom; the arithmetic itself follows spec §4.9 exactly, computed entirely
// in `Decimal` (no float intermediate for money).
// =============================================================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::money::Money;

pub struct QuantitySizer;

impl QuantitySizer {
    /// `lots(symbol, premium) -> int`, per spec §4.9.
    #[allow(clippy::too_many_arguments)]
    pub fn lots(
        available: Money,
        allocation_pct: Decimal,
        premium: Money,
        slippage_buffer_pct: Decimal,
        lot_size: Option<i64>,
        max_lots_per_trade: i64,
        qty_multiplier_cap: i64,
    ) -> i64 {
        if premium.as_decimal() <= Decimal::ZERO || available.as_decimal() <= Decimal::ZERO {
            return 0;
        }
        let lot_size = match lot_size {
            Some(l) if l > 0 => l,
            _ => return 0,
        };

        let alloc = available.mul_scalar(allocation_pct / Decimal::from(100)).unwrap();
        let adj_prem = premium
            .mul_scalar(Decimal::ONE + slippage_buffer_pct / Decimal::from(100))
            .unwrap();
        let denom = adj_prem.as_decimal() * Decimal::from(lot_size);
        if denom <= Decimal::ZERO {
            return 0;
        }

        let raw_lots = (alloc.as_decimal() / denom).floor().to_i64().unwrap_or(0);
        raw_lots.max(0).min(max_lots_per_trade).min(qty_multiplier_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn m(v: i64) -> Money {
        Money::from_decimal(Decimal::from(v))
    }

    #[test]
    fn computes_lots_within_allocation() {
        let lots = QuantitySizer::lots(m(100_000), dec!(2), m(120), dec!(1), Some(75), 10, 10);
        // alloc = 2000; adj_prem = 121.2; denom = 121.2*75 = 9090; floor(2000/9090) = 0
        assert_eq!(lots, 0);
    }

    #[test]
    fn computes_nonzero_lots_with_larger_allocation() {
        let lots = QuantitySizer::lots(m(1_000_000), dec!(2), m(120), dec!(1), Some(75), 10, 10);
        // alloc = 20000; denom = 9090; floor ~= 2
        assert_eq!(lots, 2);
    }

    #[test]
    fn zero_premium_yields_zero_lots() {
        assert_eq!(QuantitySizer::lots(m(100_000), dec!(2), m(0), dec!(1), Some(75), 10, 10), 0);
    }

    #[test]
    fn missing_lot_size_yields_zero_lots() {
        assert_eq!(QuantitySizer::lots(m(100_000), dec!(2), m(120), dec!(1), None, 10, 10), 0);
    }

    #[test]
    fn caps_are_respected() {
        let lots = QuantitySizer::lots(m(100_000_000), dec!(50), m(10), dec!(0), Some(75), 5, 3);
        assert_eq!(lots, 3);
    }

    #[test]
    fn zero_balance_yields_zero_lots() {
        assert_eq!(QuantitySizer::lots(m(0), dec!(2), m(120), dec!(1), Some(75), 10, 10), 0);
    }
}
