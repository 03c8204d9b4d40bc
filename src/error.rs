// =============================================================================
// Error taxonomy — typed business-logic failures vs. programming bugs
// =============================================================================
//
// Business-logic failures (insufficient balance, stale price, broker
// rejection, ...) are returned as `TradeError` and handled by the caller:
// the current decision tick skips with a log, never aborts. Only genuine
// programming bugs propagate as `anyhow::Error` up to the Supervisor, which
// logs and continues the next decision tick.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TradeError {
    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("insufficient position")]
    InsufficientPosition,

    #[error("invalid price")]
    InvalidPrice,

    #[error("stale price")]
    StalePrice,

    #[error("missing instrument")]
    MissingInstrument,

    #[error("broker transient error: {0}")]
    BrokerTransient(String),

    #[error("broker permanent error: {0}")]
    BrokerPermanent(String),

    #[error("durable store unavailable")]
    StoreUnavailable,

    #[error("feed stale")]
    FeedStale,

    #[error("disconnected")]
    Disconnected,

    #[error("panic")]
    Panic,

    #[error("duplicate request already in flight")]
    DuplicateRequest,
}

impl TradeError {
    /// Short machine-readable tag used in logs and the session report's
    /// failure-by-kind tally.
    pub fn kind(&self) -> &'static str {
        match self {
            TradeError::InsufficientBalance => "INSUFFICIENT_BALANCE",
            TradeError::InsufficientPosition => "INSUFFICIENT_POSITION",
            TradeError::InvalidPrice => "INVALID_PRICE",
            TradeError::StalePrice => "STALE_PRICE",
            TradeError::MissingInstrument => "MISSING_INSTRUMENT",
            TradeError::BrokerTransient(_) => "BROKER_TRANSIENT",
            TradeError::BrokerPermanent(_) => "BROKER_PERMANENT",
            TradeError::StoreUnavailable => "STORE_UNAVAILABLE",
            TradeError::FeedStale => "FEED_STALE",
            TradeError::Disconnected => "DISCONNECTED",
            TradeError::Panic => "PANIC",
            TradeError::DuplicateRequest => "DUPLICATE_REQUEST",
        }
    }

    /// Whether this failure quarantines the affected position until operator
    /// intervention (spec: only `BrokerPermanent` does).
    pub fn quarantines_position(&self) -> bool {
        matches!(self, TradeError::BrokerPermanent(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(TradeError::InsufficientBalance.kind(), "INSUFFICIENT_BALANCE");
        assert_eq!(TradeError::StalePrice.kind(), "STALE_PRICE");
        assert_eq!(
            TradeError::BrokerTransient("timeout".into()).kind(),
            "BROKER_TRANSIENT"
        );
    }

    #[test]
    fn only_broker_permanent_quarantines() {
        assert!(TradeError::BrokerPermanent("rejected".into()).quarantines_position());
        assert!(!TradeError::BrokerTransient("timeout".into()).quarantines_position());
        assert!(!TradeError::InsufficientBalance.quarantines_position());
    }
}
