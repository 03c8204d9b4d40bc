// =============================================================================
// OptionPicker — nearest-expiry + ATM-strike selection from a spot price
// =============================================================================

use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use tracing::warn;

use crate::instrument::InstrumentResolver;
use crate::money::Money;
use crate::types::{Mode, Right, SecurityId, Segment};

#[derive(Debug, Clone)]
pub struct OptionPick {
    pub expiry: NaiveDate,
    pub strikes: [i64; 3],
    pub ce_sid: HashMap<i64, SecurityId>,
    pub pe_sid: HashMap<i64, SecurityId>,
    pub segment: Segment,
}

pub struct OptionPicker {
    resolver: std::sync::Arc<dyn InstrumentResolver>,
}

impl OptionPicker {
    pub fn new(resolver: std::sync::Arc<dyn InstrumentResolver>) -> Self {
        Self { resolver }
    }

    /// Round `spot` to the nearest multiple of `strike_step`.
    pub fn nearest_strike(spot: Money, strike_step: i64) -> i64 {
        let spot_f = spot.as_decimal().to_f64().unwrap_or(0.0);
        let step = strike_step as f64;
        ((spot_f / step).round() * step) as i64
    }

    /// Smallest expiry on or after `today` matching `expiry_weekday`,
    /// falling back to the resolver's nearest listed expiry when none
    /// matches the configured weekday exactly.
    pub fn nearest_expiry(
        &self,
        symbol: &str,
        today: NaiveDate,
        expiry_weekday: chrono::Weekday,
    ) -> Option<NaiveDate> {
        let expiries = self.resolver.expiries(symbol);
        let mut candidates: Vec<NaiveDate> = expiries
            .iter()
            .copied()
            .filter(|e| *e >= today)
            .collect();
        candidates.sort();

        candidates
            .iter()
            .find(|e| e.weekday() == expiry_weekday)
            .copied()
            .or_else(|| candidates.first().copied())
    }

    pub fn pick(
        &self,
        symbol: &str,
        spot: Money,
        strike_step: i64,
        segment_opt: Segment,
        today: NaiveDate,
        expiry_weekday: chrono::Weekday,
        mode: Mode,
    ) -> Option<OptionPick> {
        let expiry = match self.nearest_expiry(symbol, today, expiry_weekday) {
            Some(e) => e,
            None if mode == Mode::Paper => {
                warn!(symbol, "no expiry resolvable in paper mode — skipping tick");
                return None;
            }
            None => {
                warn!(symbol, "no expiry resolvable in live mode — fatal for this decision tick");
                return None;
            }
        };

        let atm = Self::nearest_strike(spot, strike_step);
        let strikes = [atm - strike_step, atm, atm + strike_step];

        let mut ce_sid = HashMap::new();
        let mut pe_sid = HashMap::new();
        let mut any_missing = false;

        for strike in strikes {
            match self.resolver.security_id(symbol, expiry, strike, Right::Call) {
                Some(id) => {
                    ce_sid.insert(strike, id);
                }
                None => any_missing = true,
            }
            match self.resolver.security_id(symbol, expiry, strike, Right::Put) {
                Some(id) => {
                    pe_sid.insert(strike, id);
                }
                None => any_missing = true,
            }
        }

        if any_missing && mode == Mode::Live && !ce_sid.contains_key(&atm) && !pe_sid.contains_key(&atm) {
            warn!(symbol, "ATM strike unresolved in live mode — fatal for this decision tick");
            return None;
        }

        Some(OptionPick {
            expiry,
            strikes,
            ce_sid,
            pe_sid,
            segment: segment_opt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::StaticInstrumentResolver;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn resolver_with_atm() -> (Arc<dyn InstrumentResolver>, NaiveDate) {
        let mut r = StaticInstrumentResolver::new();
        let expiry = NaiveDate::from_ymd_opt(2026, 7, 30).unwrap(); // Thursday
        for strike in [24900, 25000, 25100] {
            r.insert("NIFTY", expiry, strike, Right::Call, SecurityId(strike), 75, "NSE_FO");
            r.insert("NIFTY", expiry, strike, Right::Put, SecurityId(strike + 1), 75, "NSE_FO");
        }
        (Arc::new(r), expiry)
    }

    #[test]
    fn nearest_strike_rounds_to_step() {
        let spot = Money::from_decimal(Decimal::from(25037));
        assert_eq!(OptionPicker::nearest_strike(spot, 100), 25000);
        let spot2 = Money::from_decimal(Decimal::from(25061));
        assert_eq!(OptionPicker::nearest_strike(spot2, 100), 25100);
    }

    #[test]
    fn nearest_expiry_matches_configured_weekday() {
        let (resolver, expiry) = resolver_with_atm();
        let picker = OptionPicker::new(resolver);
        let today = NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        let picked = picker.nearest_expiry("NIFTY", today, chrono::Weekday::Thu);
        assert_eq!(picked, Some(expiry));
    }

    #[test]
    fn pick_resolves_atm_and_neighbors() {
        let (resolver, expiry) = resolver_with_atm();
        let picker = OptionPicker::new(resolver);
        let today = NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        let spot = Money::from_decimal(Decimal::from(25010));
        let pick = picker
            .pick("NIFTY", spot, 100, "NSE_FO".into(), today, chrono::Weekday::Thu, Mode::Paper)
            .unwrap();
        assert_eq!(pick.expiry, expiry);
        assert_eq!(pick.strikes, [24900, 25000, 25100]);
        assert_eq!(pick.ce_sid.get(&25000), Some(&SecurityId(25000)));
    }

    #[test]
    fn pick_returns_none_when_no_expiry_available() {
        let resolver: Arc<dyn InstrumentResolver> = Arc::new(StaticInstrumentResolver::new());
        let picker = OptionPicker::new(resolver);
        let today = NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        let spot = Money::from_decimal(Decimal::from(25000));
        assert!(picker
            .pick("NIFTY", spot, 100, "NSE_FO".into(), today, chrono::Weekday::Thu, Mode::Paper)
            .is_none());
    }
}
