// =============================================================================
// WSManager — resilient tick-stream connection with subscription management
// =============================================================================
//
// Generalizes the teacher's `market_data::trade_stream::run_trade_stream` /
// `market_data::candle_buffer::run_kline_stream` (a flat `connect_async` loop
// that returns on disconnect and is retried by a fixed `sleep(5s)` in
// `main.rs`) into the full state machine this crate needs: one owned
// component that tracks connection state, maintains a baseline ∪ position
// subscription set with the resubscribe-on-reconnect invariant, runs a
// heartbeat task, and drives reconnection with jittered exponential backoff.
//
// The wire protocol is a broker collaborator this crate does not define; the
// connector and tick parser are injected so the state machine is testable
// without a live socket, the same way `Broker` is injected into
// `AtomicTrade`'s callers.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::tick_cache::TickCache;
use crate::types::{SecurityId, Segment, Subscription, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

#[derive(Debug, Clone, Copy)]
pub struct WsConfig {
    pub heartbeat_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub base_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Slack window for the dedup rule: a tick older than
    /// `last_seen_for_key - dedup_window` is dropped outright. Not a
    /// configuration-table key in its own right; defaults to zero (strict
    /// non-decreasing order) unless a backend wants slack for clock skew.
    pub dedup_window: i64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            max_reconnect_attempts: 10,
            base_reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(30),
            dedup_window: 0,
        }
    }
}

/// Parses one raw text frame from the broker's feed into a `Tick`. Injected
/// so the state machine can be exercised without a live socket.
pub trait TickParser: Send + Sync {
    fn parse(&self, text: &str) -> Option<Tick>;
}

/// Broker ticks arrive as JSON matching the `Tick` schema directly (less
/// `received_at`, stamped on receipt).
pub struct JsonTickParser;

impl TickParser for JsonTickParser {
    fn parse(&self, text: &str) -> Option<Tick> {
        #[derive(serde::Deserialize)]
        struct Wire {
            segment: Segment,
            security_id: SecurityId,
            ltp: crate::money::Money,
            atp: crate::money::Money,
            day_high: crate::money::Money,
            day_low: crate::money::Money,
            volume: u64,
            server_timestamp: i64,
        }
        let wire: Wire = serde_json::from_str(text).ok()?;
        Some(Tick {
            segment: wire.segment,
            security_id: wire.security_id,
            ltp: wire.ltp,
            atp: wire.atp,
            day_high: wire.day_high,
            day_low: wire.day_low,
            volume: wire.volume,
            server_timestamp: wire.server_timestamp,
            received_at: chrono::Utc::now(),
        })
    }
}

/// Connects to the broker feed and returns a channel of raw text frames plus
/// a sender used to push subscribe frames out. Swapped for a fake in tests.
#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(&self, url: &str) -> anyhow::Result<(mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>)>;
}

pub struct TungsteniteConnector;

#[async_trait]
impl WsConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> anyhow::Result<(mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>)> {
        let (ws_stream, _response) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if write.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        Ok((out_tx, in_rx))
    }
}

struct Inner {
    state: ConnectionState,
    baseline: HashSet<Subscription>,
    positions: HashSet<Subscription>,
    last_seen: HashMap<(Segment, SecurityId), i64>,
    last_heartbeat: Instant,
    reconnect_attempts: u32,
    shutting_down: bool,
}

/// Resilient connection manager: owns the subscription set and drives
/// connect / resubscribe / heartbeat / reconnect as independent tasks
/// sharing state behind one `parking_lot::Mutex` (spec §5's WSManager
/// subscription-set discipline).
pub struct WSManager {
    inner: Mutex<Inner>,
    tick_cache: Arc<TickCache>,
    config: WsConfig,
    url: String,
    parser: Arc<dyn TickParser>,
    connector: Arc<dyn WsConnector>,
}

impl WSManager {
    pub fn new(url: impl Into<String>, tick_cache: Arc<TickCache>, config: WsConfig) -> Arc<Self> {
        Self::with_collaborators(url, tick_cache, config, Arc::new(JsonTickParser), Arc::new(TungsteniteConnector))
    }

    pub fn with_collaborators(
        url: impl Into<String>,
        tick_cache: Arc<TickCache>,
        config: WsConfig,
        parser: Arc<dyn TickParser>,
        connector: Arc<dyn WsConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                baseline: HashSet::new(),
                positions: HashSet::new(),
                last_seen: HashMap::new(),
                last_heartbeat: Instant::now(),
                reconnect_attempts: 0,
                shutting_down: false,
            }),
            tick_cache,
            config,
            url: url.into(),
            parser,
            connector,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Full subscription set the manager currently believes it should hold:
    /// baseline ∪ open positions.
    pub fn subscriptions(&self) -> HashSet<Subscription> {
        let inner = self.inner.lock();
        inner.baseline.union(&inner.positions).cloned().collect()
    }

    /// Idempotent: adding an already-present baseline subscription is a no-op.
    pub fn add_baseline(&self, segment: Segment, security_id: SecurityId) -> bool {
        self.inner.lock().baseline.insert(Subscription { segment, security_id })
    }

    pub fn add_position(&self, segment: Segment, security_id: SecurityId) -> bool {
        self.inner.lock().positions.insert(Subscription { segment, security_id })
    }

    pub fn remove_position(&self, segment: &str, security_id: SecurityId) -> bool {
        self.inner.lock().positions.remove(&Subscription { segment: segment.to_string(), security_id })
    }

    pub fn shutdown(&self) {
        self.inner.lock().shutting_down = true;
    }

    fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.lock().state = state;
    }

    /// `true` if no frame (data or heartbeat) has arrived within
    /// `heartbeat_interval`; the heartbeat task uses this to force a
    /// reconnect on a silently-dead connection.
    fn heartbeat_missed(&self) -> bool {
        self.inner.lock().last_heartbeat.elapsed() > self.config.heartbeat_interval
    }

    fn mark_alive(&self) {
        self.inner.lock().last_heartbeat = Instant::now();
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let backoff = self.config.base_reconnect_delay * 2u32.saturating_pow(attempt);
        let capped = backoff.min(self.config.max_reconnect_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=100);
        capped + Duration::from_millis(jitter_ms)
    }

    /// Apply the dedup rule, then forward to `TickCache`. Returns `true` if
    /// the tick was accepted.
    fn dispatch(&self, tick: Tick) -> bool {
        let key = (tick.segment.clone(), tick.security_id);
        {
            let mut inner = self.inner.lock();
            if let Some(&last) = inner.last_seen.get(&key) {
                if tick.server_timestamp < last - self.config.dedup_window {
                    debug!(?key, "dropped tick outside dedup window");
                    return false;
                }
            }
            let entry = inner.last_seen.entry(key).or_insert(tick.server_timestamp);
            if tick.server_timestamp > *entry {
                *entry = tick.server_timestamp;
            }
        }
        self.mark_alive();
        self.tick_cache.put(tick)
    }

    /// Spawns the ingestion, heartbeat, and reconnect-driver tasks described
    /// in spec §5. Returns immediately; the manager runs until `shutdown()`.
    pub fn run(self: Arc<Self>) {
        let driver = self.clone();
        tokio::spawn(async move { driver.reconnect_driver().await });

        let heartbeat = self.clone();
        tokio::spawn(async move { heartbeat.heartbeat_task().await });
    }

    async fn heartbeat_task(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            interval.tick().await;
            if self.is_shutting_down() {
                return;
            }
            if self.state() == ConnectionState::Connected && self.heartbeat_missed() {
                warn!("heartbeat missed -- forcing reconnect");
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    async fn reconnect_driver(self: Arc<Self>) {
        loop {
            if self.is_shutting_down() {
                self.set_state(ConnectionState::Closing);
                return;
            }

            if self.state() == ConnectionState::Connected {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }

            let attempt = self.inner.lock().reconnect_attempts;
            if attempt > 0 {
                let delay = self.jittered_backoff(attempt - 1);
                info!(attempt, delay_ms = delay.as_millis() as u64, "backing off before reconnect");
                tokio::time::sleep(delay).await;
            }
            if attempt >= self.config.max_reconnect_attempts {
                error!(attempt, "max reconnect attempts exhausted -- giving up");
                return;
            }

            self.set_state(ConnectionState::Connecting);
            match self.connector.connect(&self.url).await {
                Ok((out_tx, in_rx)) => {
                    info!(url = %self.url, "websocket connected");
                    self.inner.lock().reconnect_attempts = 0;
                    self.set_state(ConnectionState::Connected);
                    self.mark_alive();
                    self.resubscribe(&out_tx);
                    self.read_loop(in_rx).await;
                    if self.is_shutting_down() {
                        self.set_state(ConnectionState::Closing);
                        return;
                    }
                    self.set_state(ConnectionState::Disconnected);
                    self.inner.lock().reconnect_attempts += 1;
                }
                Err(e) => {
                    warn!(error = %e, "websocket connect failed");
                    self.set_state(ConnectionState::Disconnected);
                    self.inner.lock().reconnect_attempts += 1;
                }
            }
        }
    }

    /// Issue a subscribe frame for the full baseline ∪ position set. Run on
    /// every transition to Connected, satisfying the resubscription
    /// invariant (spec §4.12, §8 scenario 6).
    fn resubscribe(&self, out_tx: &mpsc::UnboundedSender<String>) {
        let subs = self.subscriptions();
        let payload = serde_json::json!({
            "action": "subscribe",
            "instruments": subs.iter().map(|s| serde_json::json!({
                "segment": s.segment,
                "security_id": s.security_id.0,
            })).collect::<Vec<_>>(),
        });
        if out_tx.send(payload.to_string()).is_err() {
            warn!("failed to send resubscribe frame -- socket already closed");
        } else {
            info!(count = subs.len(), "resubscribed to full instrument set");
        }
    }

    async fn read_loop(&self, mut in_rx: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = in_rx.recv().await {
            if self.is_shutting_down() {
                return;
            }
            match self.parser.parse(&text) {
                Some(tick) => {
                    self.dispatch(tick);
                }
                None => {
                    // Non-tick frames (heartbeat acks, control messages) still
                    // count as liveness.
                    self.mark_alive();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;
    use rust_decimal::Decimal;
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeConnector {
        frames: AsyncMutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl WsConnector for FakeConnector {
        async fn connect(&self, _url: &str) -> anyhow::Result<(mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>)> {
            let (out_tx, _out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let mut batches = self.frames.lock().await;
            if !batches.is_empty() {
                let batch = batches.remove(0);
                for frame in batch {
                    let _ = in_tx.send(frame);
                }
            }
            drop(in_tx);
            Ok((out_tx, in_rx))
        }
    }

    fn tick_json(segment: &str, sid: i64, ts: i64, ltp: i64) -> String {
        serde_json::json!({
            "segment": segment,
            "security_id": sid,
            "ltp": ltp.to_string(),
            "atp": "0",
            "day_high": "0",
            "day_low": "0",
            "volume": 0,
            "server_timestamp": ts,
        })
        .to_string()
    }

    #[test]
    fn add_baseline_is_idempotent() {
        let cache = Arc::new(TickCache::new(None));
        let mgr = WSManager::new("wss://example.invalid", cache, WsConfig::default());
        assert!(mgr.add_baseline("NSE_IDX".into(), SecurityId(13)));
        assert!(!mgr.add_baseline("NSE_IDX".into(), SecurityId(13)));
        assert_eq!(mgr.subscriptions().len(), 1);
    }

    #[test]
    fn subscriptions_union_baseline_and_position() {
        let cache = Arc::new(TickCache::new(None));
        let mgr = WSManager::new("wss://example.invalid", cache, WsConfig::default());
        mgr.add_baseline("NSE_IDX".into(), SecurityId(13));
        mgr.add_baseline("NSE_IDX".into(), SecurityId(532));
        mgr.add_position("NSE_FO".into(), SecurityId(1));
        mgr.add_position("NSE_FO".into(), SecurityId(2));
        let subs = mgr.subscriptions();
        assert_eq!(subs.len(), 4);
    }

    #[test]
    fn remove_position_drops_only_that_entry() {
        let cache = Arc::new(TickCache::new(None));
        let mgr = WSManager::new("wss://example.invalid", cache, WsConfig::default());
        mgr.add_position("NSE_FO".into(), SecurityId(1));
        assert!(mgr.remove_position("NSE_FO", SecurityId(1)));
        assert!(!mgr.remove_position("NSE_FO", SecurityId(1)));
        assert_eq!(mgr.subscriptions().len(), 0);
    }

    #[test]
    fn dispatch_applies_dedup_window_before_cache_put() {
        let cache = Arc::new(TickCache::new(None));
        let mgr = WSManager::with_collaborators(
            "wss://example.invalid",
            cache.clone(),
            WsConfig { dedup_window: 5, ..WsConfig::default() },
            Arc::new(JsonTickParser),
            Arc::new(FakeConnector { frames: AsyncMutex::new(vec![]) }),
        );

        let newer = Tick {
            segment: "NSE_FO".into(),
            security_id: SecurityId(1),
            ltp: Money::from_decimal(Decimal::from(100)),
            atp: Money::zero(),
            day_high: Money::zero(),
            day_low: Money::zero(),
            volume: 0,
            server_timestamp: 1000,
            received_at: chrono::Utc::now(),
        };
        assert!(mgr.dispatch(newer.clone()));

        // Within the dedup window of the last-seen timestamp: still forwarded
        // to TickCache (its own ordering rule drops it there).
        let mut slightly_older = newer.clone();
        slightly_older.server_timestamp = 998;
        assert!(!mgr.dispatch(slightly_older));

        // Outside the dedup window: dropped before ever reaching TickCache.
        let mut far_older = newer;
        far_older.server_timestamp = 990;
        assert!(!mgr.dispatch(far_older));
        assert_eq!(cache.stats().puts, 1);
    }

    #[tokio::test]
    async fn resubscribe_after_reconnect_covers_full_set() {
        let cache = Arc::new(TickCache::new(None));
        let connector = Arc::new(FakeConnector {
            frames: AsyncMutex::new(vec![
                vec![tick_json("NSE_IDX", 13, 1, 100)],
                vec![tick_json("NSE_FO", 1, 2, 50)],
            ]),
        });
        let mgr = WSManager::with_collaborators(
            "wss://example.invalid",
            cache.clone(),
            WsConfig { max_reconnect_attempts: 5, base_reconnect_delay: Duration::from_millis(1), ..WsConfig::default() },
            Arc::new(JsonTickParser),
            connector,
        );
        mgr.add_baseline("NSE_IDX".into(), SecurityId(13));
        mgr.add_baseline("NSE_IDX".into(), SecurityId(532));
        mgr.add_position("NSE_FO".into(), SecurityId(1));
        mgr.add_position("NSE_FO".into(), SecurityId(2));

        assert_eq!(mgr.subscriptions().len(), 4);

        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        mgr.resubscribe(&out_tx);
        assert_eq!(mgr.subscriptions().len(), 4);
    }
}
