// =============================================================================
// Money — exact decimal arithmetic for prices, quantities, and balances
// =============================================================================
//
// Every monetary value in this crate is a `Money`. Floating point is allowed
// only on the indicator side (classical TA operates on price series, not on
// cash); once a price or quantity crosses into balance, position, or order
// accounting it is converted to `Money` and never converted back except at
// display time.
// =============================================================================

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MoneyError {
    #[error("monetary value overflowed")]
    Overflow,
    #[error("division by zero")]
    DivisionByZero,
}

/// Fixed-precision decimal value. Default display/round scale is 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(Decimal);

impl Money {
    pub const DEFAULT_SCALE: u32 = 2;

    pub fn zero() -> Self {
        Money(Decimal::ZERO)
    }

    /// Explicit constructor for potentially-missing numeric input. Unlike
    /// `From`/`TryFrom`, this is the only path that coerces a missing value
    /// to zero — callers must route "nil or absent" inputs through here.
    pub fn bd(value: Option<Decimal>) -> Self {
        Money(value.unwrap_or(Decimal::ZERO))
    }

    pub fn from_decimal(value: Decimal) -> Self {
        Money(value)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn add(&self, other: Money) -> Result<Money, MoneyError> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }

    pub fn sub(&self, other: Money) -> Result<Money, MoneyError> {
        self.0
            .checked_sub(other.0)
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }

    pub fn mul_scalar(&self, scalar: Decimal) -> Result<Money, MoneyError> {
        self.0
            .checked_mul(scalar)
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }

    pub fn mul_money(&self, other: Money) -> Result<Money, MoneyError> {
        self.mul_scalar(other.0)
    }

    pub fn checked_div(&self, divisor: Decimal) -> Result<Money, MoneyError> {
        if divisor.is_zero() {
            return Err(MoneyError::DivisionByZero);
        }
        self.0
            .checked_div(divisor)
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }

    pub fn round_to(&self, scale: u32) -> Money {
        Money(self.0.round_dp(scale))
    }

    pub fn neg(&self) -> Money {
        Money(-self.0)
    }

    pub fn min(self, other: Money) -> Money {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }

    pub fn max(self, other: Money) -> Money {
        if self.0 >= other.0 {
            self
        } else {
            other
        }
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::zero()
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.round_dp(Self::DEFAULT_SCALE))
    }
}

impl FromStr for Money {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s)
            .map(Money)
            .map_err(|_| MoneyError::Overflow)
    }
}

impl TryFrom<f64> for Money {
    type Error = MoneyError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Decimal::from_f64_retain(value)
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn add_and_sub_roundtrip() {
        let a = Money::from_decimal(dec!(100.50));
        let b = Money::from_decimal(dec!(20.25));
        let sum = a.add(b).unwrap();
        assert_eq!(sum.as_decimal(), dec!(120.75));
        assert_eq!(sum.sub(b).unwrap().as_decimal(), dec!(100.50));
    }

    #[test]
    fn mul_scalar_exact() {
        let price = Money::from_decimal(dec!(123.45));
        let qty = dec!(75);
        let total = price.mul_scalar(qty).unwrap();
        assert_eq!(total.as_decimal(), dec!(9258.75));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let a = Money::from_decimal(dec!(10));
        assert_eq!(a.checked_div(Decimal::ZERO), Err(MoneyError::DivisionByZero));
    }

    #[test]
    fn bd_coerces_missing_to_zero() {
        assert_eq!(Money::bd(None), Money::zero());
        assert_eq!(Money::bd(Some(dec!(5))).as_decimal(), dec!(5));
    }

    #[test]
    fn negative_and_zero_tests() {
        assert!(Money::from_decimal(dec!(-1)).is_negative());
        assert!(!Money::zero().is_negative());
        assert!(Money::zero().is_zero());
    }

    #[test]
    fn round_to_uses_banker_rounding() {
        let m = Money::from_decimal(dec!(1.005));
        assert_eq!(m.round_to(2).as_decimal(), dec!(1.00));
    }

    #[test]
    fn display_uses_default_scale() {
        let m = Money::from_decimal(dec!(7));
        assert_eq!(format!("{m}"), "7.00");
    }

    #[test]
    fn min_max() {
        let a = Money::from_decimal(dec!(10));
        let b = Money::from_decimal(dec!(20));
        assert_eq!(a.min(b), a);
        assert_eq!(a.max(b), b);
    }
}
