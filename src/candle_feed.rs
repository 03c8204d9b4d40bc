// =============================================================================
// CandleFeed — tick-driven OHLC aggregation
// =============================================================================
//
// Generalizes the teacher's `market_data::CandleBuffer` ring buffer (per-key
// `VecDeque<Candle>`, in-progress candle replaced in place until its bucket
// closes, then trimmed to a max length) from a Binance kline websocket feed
// to this engine's tick pipeline: the broker's streaming wire format is
// opaque (see `ws_manager::TickParser`), so there is no native OHLC bar to
// consume. Instead `CandleFeed` polls the underlying index's last traded
// price out of `TickCache` on a fixed cadence and buckets samples into
// fixed-width time buckets itself, exactly as `CandleBuffer::update` buckets
// an incoming kline by `open_time`.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use tracing::warn;

use crate::entry_manager::CandleProvider;
use crate::tick_cache::TickCache;
use crate::types::{Candle, CandleSeries, SecurityId, Segment};

const DEFAULT_MAX_CANDLES: usize = 300;

#[derive(Debug, Clone, Copy)]
enum Timeframe {
    Primary,
    Secondary,
}

impl Timeframe {
    fn label(self) -> &'static str {
        match self {
            Timeframe::Primary => "primary",
            Timeframe::Secondary => "secondary",
        }
    }
}

/// One polled underlying: the symbol name used by `EntryManager`, the
/// broker key used to read `TickCache`, and the bucket widths for the two
/// timeframes `EntryManager` asks for.
#[derive(Debug, Clone)]
pub struct CandleFeedTarget {
    pub symbol: String,
    pub segment: Segment,
    pub security_id: SecurityId,
    pub primary_interval_secs: i64,
    pub secondary_interval_secs: Option<i64>,
}

type SeriesKey = (String, &'static str);

/// Keeps a rolling OHLC series per (symbol, timeframe), fed by periodically
/// sampling `TickCache`.
pub struct CandleFeed {
    buffers: DashMap<SeriesKey, VecDeque<Candle>>,
    max_candles: usize,
}

impl CandleFeed {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_CANDLES)
    }

    pub fn with_capacity(max_candles: usize) -> Self {
        Self {
            buffers: DashMap::new(),
            max_candles,
        }
    }

    /// Fold one price sample into the bucket it falls into. If the sample
    /// lands in the same bucket as the most recent (possibly still-open)
    /// candle, that candle's high/low/close/volume are updated in place.
    /// Otherwise the previous candle is marked closed and a new one opens.
    fn ingest(&self, symbol: &str, timeframe: Timeframe, interval_secs: i64, ts_ms: i64, price: f64) {
        if interval_secs <= 0 {
            return;
        }
        let bucket_ms = interval_secs * 1000;
        let open_time = (ts_ms / bucket_ms) * bucket_ms;
        let close_time = open_time + bucket_ms - 1;

        let key: SeriesKey = (symbol.to_string(), timeframe.label());
        let mut series = self.buffers.entry(key).or_insert_with(VecDeque::new);

        match series.back_mut() {
            Some(last) if last.open_time == open_time => {
                last.high = last.high.max(price);
                last.low = last.low.min(price);
                last.close = price;
                last.volume += 1.0;
            }
            Some(last) => {
                last.is_closed = true;
                series.push_back(Candle {
                    open_time,
                    close_time,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: 1.0,
                    is_closed: false,
                });
            }
            None => {
                series.push_back(Candle {
                    open_time,
                    close_time,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: 1.0,
                    is_closed: false,
                });
            }
        }

        while series.len() > self.max_candles {
            series.pop_front();
        }
    }

    fn series_for(&self, symbol: &str, timeframe: Timeframe) -> Option<CandleSeries> {
        let key: SeriesKey = (symbol.to_string(), timeframe.label());
        self.buffers
            .get(&key)
            .map(|entry| CandleSeries { candles: entry.iter().cloned().collect() })
    }

    /// Spawn the polling loop that keeps this feed populated. Returns the
    /// join handle so the caller can track it alongside its other tasks;
    /// the loop runs until the process exits.
    pub fn spawn_poller(
        self: Arc<Self>,
        tick_cache: Arc<TickCache>,
        targets: Vec<CandleFeedTarget>,
        poll_interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                let now_ms = chrono::Utc::now().timestamp_millis();

                for target in &targets {
                    let Some(tick) = tick_cache.get(&target.segment, target.security_id) else {
                        continue;
                    };
                    let price = match tick.ltp.as_decimal().to_f64() {
                        Some(p) => p,
                        None => {
                            warn!(symbol = %target.symbol, "candle feed: unrepresentable ltp, skipping sample");
                            continue;
                        }
                    };

                    self.ingest(&target.symbol, Timeframe::Primary, target.primary_interval_secs, now_ms, price);
                    if let Some(secondary_secs) = target.secondary_interval_secs {
                        self.ingest(&target.symbol, Timeframe::Secondary, secondary_secs, now_ms, price);
                    }
                }
            }
        })
    }
}

impl Default for CandleFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl CandleProvider for CandleFeed {
    fn primary(&self, symbol: &str) -> Option<CandleSeries> {
        self.series_for(symbol, Timeframe::Primary)
    }

    fn secondary(&self, symbol: &str) -> Option<CandleSeries> {
        self.series_for(symbol, Timeframe::Secondary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_buckets_samples_into_one_candle() {
        let feed = CandleFeed::new();
        feed.ingest("NIFTY", Timeframe::Primary, 60, 0, 100.0);
        feed.ingest("NIFTY", Timeframe::Primary, 60, 10_000, 105.0);
        feed.ingest("NIFTY", Timeframe::Primary, 60, 30_000, 95.0);

        let series = feed.primary("NIFTY").unwrap();
        assert_eq!(series.len(), 1);
        let c = &series.candles[0];
        assert_eq!(c.open, 100.0);
        assert_eq!(c.high, 105.0);
        assert_eq!(c.low, 95.0);
        assert_eq!(c.close, 95.0);
        assert!(!c.is_closed);
    }

    #[test]
    fn ingest_closes_previous_bucket_on_rollover() {
        let feed = CandleFeed::new();
        feed.ingest("NIFTY", Timeframe::Primary, 60, 0, 100.0);
        feed.ingest("NIFTY", Timeframe::Primary, 60, 61_000, 110.0);

        let series = feed.primary("NIFTY").unwrap();
        assert_eq!(series.len(), 2);
        assert!(series.candles[0].is_closed);
        assert!(!series.candles[1].is_closed);
        assert_eq!(series.candles[1].open, 110.0);
    }

    #[test]
    fn ring_buffer_trims_to_max_candles() {
        let feed = CandleFeed::with_capacity(3);
        for i in 0..10 {
            feed.ingest("NIFTY", Timeframe::Primary, 60, i * 60_000, 100.0 + i as f64);
        }
        let series = feed.primary("NIFTY").unwrap();
        assert_eq!(series.len(), 3);
    }

    #[test]
    fn secondary_and_primary_are_independent_series() {
        let feed = CandleFeed::new();
        feed.ingest("NIFTY", Timeframe::Primary, 60, 0, 100.0);
        feed.ingest("NIFTY", Timeframe::Secondary, 300, 0, 100.0);

        assert!(feed.primary("NIFTY").is_some());
        assert!(feed.secondary("NIFTY").is_some());
        assert!(feed.secondary("OTHER").is_none());
    }

    #[test]
    fn unknown_symbol_returns_none() {
        let feed = CandleFeed::new();
        assert!(feed.primary("GHOST").is_none());
    }
}
