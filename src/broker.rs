// =============================================================================
// Broker — uniform order interface; Paper and Live implementations
// =============================================================================
//
// `LiveBroker` is grounded on `binance/client.rs::BinanceClient`: HMAC-SHA256
// request signing, a `reqwest::Client` with a fixed timeout, and
// `#[instrument]`-annotated async methods. `PaperBroker` is grounded on
// `execution.rs::execute_demo`, generalized to resolve fills from
// `TickCache.ltp` as spec §4.11 requires (the teacher's demo path resolves
// from the position manager directly).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::Rng;
use reqwest::Client;
use serde::Serialize;
use sha2::Sha256;
use tracing::{error, instrument, warn};
use uuid::Uuid;

use crate::balance::BalanceSnapshot;
use crate::error::TradeError;
use crate::money::Money;
use crate::tick_cache::TickCache;
use crate::types::{SecurityId, Segment, Side};

#[derive(Debug, Clone, Serialize)]
pub struct OrderSpec {
    pub segment: Segment,
    pub security_id: SecurityId,
    pub side: Side,
    pub quantity: i64,
    pub fee: Money,
}

#[derive(Debug, Clone)]
pub struct OrderResult {
    pub ok: bool,
    pub order_id: String,
    pub filled_price: Money,
    pub filled_qty: i64,
    pub error: Option<TradeError>,
}

impl OrderResult {
    fn failed(error: TradeError) -> Self {
        Self {
            ok: false,
            order_id: String::new(),
            filled_price: Money::zero(),
            filled_qty: 0,
            error: Some(error),
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn buy_market(&self, seg: Segment, id: SecurityId, qty: i64, fee: Money) -> OrderResult {
        self.place_order(OrderSpec {
            segment: seg,
            security_id: id,
            side: Side::Buy,
            quantity: qty,
            fee,
        })
        .await
    }

    async fn sell_market(&self, seg: Segment, id: SecurityId, qty: i64, fee: Money) -> OrderResult {
        self.place_order(OrderSpec {
            segment: seg,
            security_id: id,
            side: Side::Sell,
            quantity: qty,
            fee,
        })
        .await
    }

    async fn place_order(&self, spec: OrderSpec) -> OrderResult;

    /// Account funds snapshot, used by `LiveBalance`. Paper brokers need not
    /// implement this meaningfully since `SimulatedBalance` is used instead.
    async fn funds(&self) -> anyhow::Result<BalanceSnapshot> {
        anyhow::bail!("funds() not supported by this broker")
    }
}

// ---------------------------------------------------------------------------
// Paper broker
// ---------------------------------------------------------------------------

pub struct PaperBroker {
    tick_cache: Arc<TickCache>,
}

impl PaperBroker {
    pub fn new(tick_cache: Arc<TickCache>) -> Self {
        Self { tick_cache }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn place_order(&self, spec: OrderSpec) -> OrderResult {
        match self.tick_cache.ltp(&spec.segment, spec.security_id) {
            Some(price) if !price.is_zero() => OrderResult {
                ok: true,
                order_id: Uuid::new_v4().to_string(),
                filled_price: price,
                filled_qty: spec.quantity,
                error: None,
            },
            _ => OrderResult::failed(TradeError::InvalidPrice),
        }
    }
}

// ---------------------------------------------------------------------------
// Live broker
// ---------------------------------------------------------------------------

type HmacSha256 = Hmac<Sha256>;

pub struct LiveBroker {
    http: Client,
    base_url: String,
    client_id: String,
    access_token: String,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl LiveBroker {
    pub fn new(base_url: impl Into<String>, client_id: String, access_token: String) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build broker HTTP client"),
            base_url: base_url.into(),
            client_id,
            access_token,
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.access_token.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let backoff = self.base_delay * 2u32.saturating_pow(attempt);
        let capped = backoff.min(self.max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=50);
        capped + Duration::from_millis(jitter_ms)
    }

    #[instrument(skip(self), name = "live_broker.place_order")]
    async fn place_order_once(&self, spec: &OrderSpec) -> Result<OrderResult, TradeError> {
        let payload = format!(
            "client_id={}&security_id={}&side={}&quantity={}",
            self.client_id, spec.security_id, spec.side, spec.quantity
        );
        let signature = self.sign(&payload);

        let response = self
            .http
            .post(format!("{}/orders", self.base_url))
            .header("x-access-token", &self.access_token)
            .header("x-signature", signature)
            .body(payload)
            .send()
            .await
            .map_err(|e| TradeError::BrokerTransient(e.to_string()))?;

        if response.status().is_server_error() {
            return Err(TradeError::BrokerTransient(format!(
                "exchange returned {}",
                response.status()
            )));
        }
        if !response.status().is_success() {
            return Err(TradeError::BrokerPermanent(format!(
                "exchange rejected order: {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TradeError::BrokerTransient(e.to_string()))?;

        let order_id = body["orderId"].as_str().unwrap_or_default().to_string();
        let filled_price = body["avgPrice"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .map(Money::from_decimal)
            .unwrap_or_else(Money::zero);
        let filled_qty = body["filledQty"].as_i64().unwrap_or(spec.quantity);

        Ok(OrderResult {
            ok: true,
            order_id,
            filled_price,
            filled_qty,
            error: None,
        })
    }
}

#[async_trait]
impl Broker for LiveBroker {
    async fn place_order(&self, spec: OrderSpec) -> OrderResult {
        for attempt in 0..=self.max_retries {
            match self.place_order_once(&spec).await {
                Ok(result) => return result,
                Err(TradeError::BrokerTransient(reason)) => {
                    if attempt == self.max_retries {
                        error!(reason, "broker order exhausted retries");
                        return OrderResult::failed(TradeError::BrokerTransient(reason));
                    }
                    let delay = self.jittered_delay(attempt);
                    warn!(attempt, reason, delay_ms = delay.as_millis() as u64, "retrying broker order");
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return OrderResult::failed(other),
            }
        }
        unreachable!("loop always returns before exhausting the range")
    }

    async fn funds(&self) -> anyhow::Result<BalanceSnapshot> {
        let response = self
            .http
            .get(format!("{}/funds", self.base_url))
            .header("x-access-token", &self.access_token)
            .send()
            .await?
            .json::<serde_json::Value>()
            .await?;

        let parse = |field: &str| -> Money {
            response[field]
                .as_str()
                .and_then(|s| s.parse().ok())
                .map(Money::from_decimal)
                .unwrap_or_else(Money::zero)
        };

        Ok(BalanceSnapshot {
            available: parse("availabelBalance").max(parse("availableBalance")),
            used: parse("utilisedAmount"),
            total: parse("sodLimit"),
            realized_pnl: parse("realizedProfit"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn paper_broker_resolves_fill_from_tick_cache() {
        let cache = Arc::new(TickCache::new(None));
        cache.put(crate::types::Tick {
            segment: "NSE_FO".into(),
            security_id: SecurityId(1),
            ltp: Money::from_decimal(Decimal::from(125)),
            atp: Money::zero(),
            day_high: Money::zero(),
            day_low: Money::zero(),
            volume: 0,
            server_timestamp: 1,
            received_at: chrono::Utc::now(),
        });
        let broker = PaperBroker::new(cache);
        let result = broker
            .buy_market("NSE_FO".into(), SecurityId(1), 75, Money::zero())
            .await;
        assert!(result.ok);
        assert_eq!(result.filled_price, Money::from_decimal(Decimal::from(125)));
        assert_eq!(result.filled_qty, 75);
    }

    #[tokio::test]
    async fn paper_broker_fails_without_a_price() {
        let cache = Arc::new(TickCache::new(None));
        let broker = PaperBroker::new(cache);
        let result = broker
            .buy_market("NSE_FO".into(), SecurityId(99), 75, Money::zero())
            .await;
        assert!(!result.ok);
        assert_eq!(result.error, Some(TradeError::InvalidPrice));
    }

    #[test]
    fn jittered_delay_grows_and_caps() {
        let broker = LiveBroker::new("http://example.invalid", "c1".into(), "secret".into());
        let d0 = broker.jittered_delay(0);
        let d5 = broker.jittered_delay(5);
        assert!(d0 >= Duration::from_millis(250));
        assert!(d5 <= broker.max_delay + Duration::from_millis(50));
    }
}
