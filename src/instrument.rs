// =============================================================================
// InstrumentResolver — (underlying, expiry, strike, right) -> security id
// =============================================================================
//
// Out of core scope per spec §1 (the CSV master is an external collaborator),
// but a minimal loader is provided so the crate is runnable and testable
// standalone. Grounded on `aibysid-HyperLiquidMM`'s `csv` dependency; strike
// step / lot size conventions follow the Indian-options idiom in
// `other_examples/...shrivenQ...options-engine` (lot sizes, ATM strikes).
// =============================================================================

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Deserialize;

use crate::types::{Right, SecurityId, Segment};

pub trait InstrumentResolver: Send + Sync {
    fn expiries(&self, symbol: &str) -> Vec<NaiveDate>;
    fn security_id(&self, symbol: &str, expiry: NaiveDate, strike: i64, right: Right) -> Option<SecurityId>;
    fn lot_size(&self, id: SecurityId) -> Option<i64>;
    fn segment_of(&self, id: SecurityId) -> Option<Segment>;
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct OptionKey {
    symbol: String,
    expiry: NaiveDate,
    strike: i64,
    right: Right,
}

#[derive(Debug, Clone)]
struct InstrumentMeta {
    security_id: SecurityId,
    lot_size: i64,
    segment: Segment,
}

/// In-memory resolver backed by a fixed table, used directly by unit tests
/// and by `StaticInstrumentResolver::from_rows` for hand-built fixtures.
#[derive(Default)]
pub struct StaticInstrumentResolver {
    by_option: HashMap<OptionKey, InstrumentMeta>,
    expiries_by_symbol: HashMap<String, Vec<NaiveDate>>,
}

impl StaticInstrumentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        symbol: &str,
        expiry: NaiveDate,
        strike: i64,
        right: Right,
        security_id: SecurityId,
        lot_size: i64,
        segment: impl Into<Segment>,
    ) {
        self.by_option.insert(
            OptionKey {
                symbol: symbol.to_string(),
                expiry,
                strike,
                right,
            },
            InstrumentMeta {
                security_id,
                lot_size,
                segment: segment.into(),
            },
        );
        let list = self
            .expiries_by_symbol
            .entry(symbol.to_string())
            .or_default();
        if !list.contains(&expiry) {
            list.push(expiry);
            list.sort();
        }
    }
}

impl InstrumentResolver for StaticInstrumentResolver {
    fn expiries(&self, symbol: &str) -> Vec<NaiveDate> {
        self.expiries_by_symbol.get(symbol).cloned().unwrap_or_default()
    }

    fn security_id(&self, symbol: &str, expiry: NaiveDate, strike: i64, right: Right) -> Option<SecurityId> {
        self.by_option
            .get(&OptionKey {
                symbol: symbol.to_string(),
                expiry,
                strike,
                right,
            })
            .map(|m| m.security_id)
    }

    fn lot_size(&self, id: SecurityId) -> Option<i64> {
        self.by_option.values().find(|m| m.security_id == id).map(|m| m.lot_size)
    }

    fn segment_of(&self, id: SecurityId) -> Option<Segment> {
        self.by_option
            .values()
            .find(|m| m.security_id == id)
            .map(|m| m.segment.clone())
    }
}

/// One row of the broker's CSV instrument master.
#[derive(Debug, Deserialize)]
struct CsvRow {
    symbol: String,
    expiry: String,
    strike: i64,
    right: String,
    security_id: i64,
    lot_size: i64,
    segment: String,
}

/// Loads a CSV instrument master into a `StaticInstrumentResolver`-shaped
/// index at startup.
pub struct CsvInstrumentResolver {
    inner: StaticInstrumentResolver,
}

impl CsvInstrumentResolver {
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let mut inner = StaticInstrumentResolver::new();
        let mut reader = csv::Reader::from_path(path)?;
        for record in reader.deserialize() {
            let row: CsvRow = record?;
            let expiry = NaiveDate::parse_from_str(&row.expiry, "%Y-%m-%d")?;
            let right = match row.right.as_str() {
                "C" | "CE" => Right::Call,
                "P" | "PE" => Right::Put,
                other => anyhow::bail!("unrecognized option right in CSV master: {other}"),
            };
            inner.insert(
                &row.symbol,
                expiry,
                row.strike,
                right,
                SecurityId(row.security_id),
                row.lot_size,
                row.segment,
            );
        }
        Ok(Self { inner })
    }
}

impl InstrumentResolver for CsvInstrumentResolver {
    fn expiries(&self, symbol: &str) -> Vec<NaiveDate> {
        self.inner.expiries(symbol)
    }

    fn security_id(&self, symbol: &str, expiry: NaiveDate, strike: i64, right: Right) -> Option<SecurityId> {
        self.inner.security_id(symbol, expiry, strike, right)
    }

    fn lot_size(&self, id: SecurityId) -> Option<i64> {
        self.inner.lot_size(id)
    }

    fn segment_of(&self, id: SecurityId) -> Option<Segment> {
        self.inner.segment_of(id)
    }
}
