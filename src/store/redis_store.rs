// =============================================================================
// RedisStore — the production DurableStore backend
// =============================================================================
//
// Grounded on `aibysid-HyperLiquidMM`'s `publisher.rs`: a `redis::Client`
// opened once at startup, a fresh multiplexed async connection pulled per
// call (cheap — the crate multiplexes under the hood), and `AsyncCommands`
// for every primitive. `atomic` uses a MULTI/EXEC pipeline.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{info, warn};

use super::{DurableStore, StoreOp};

pub struct RedisStore {
    client: redis::Client,
    namespace: String,
}

impl RedisStore {
    pub fn connect(url: &str, namespace: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).context("failed to open redis client")?;
        info!(url, "durable store configured");
        Ok(Self {
            client,
            namespace: namespace.into(),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .context("failed to get redis connection")
    }

    fn ns(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.hset(self.ns(key), field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn.hget(self.ns(key), field).await?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        let value: HashMap<String, String> = conn.hgetall(self.ns(key)).await?;
        Ok(value)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.sadd(self.ns(key), member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.srem(self.ns(key), member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let value: Vec<String> = conn.smembers(self.ns(key)).await?;
        Ok(value)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.lpush(self.ns(key), value).await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let value: Vec<String> = conn.lrange(self.ns(key), start, stop).await?;
        Ok(value)
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.ltrim(self.ns(key), start, stop).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.expire(self.ns(key), ttl_secs as i64).await?;
        Ok(())
    }

    async fn atomic(&self, ops: Vec<StoreOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                StoreOp::HSet { key, field, value } => {
                    pipe.hset(self.ns(key), field, value).ignore();
                }
                StoreOp::SAdd { key, member } => {
                    pipe.sadd(self.ns(key), member).ignore();
                }
                StoreOp::SRem { key, member } => {
                    pipe.srem(self.ns(key), member).ignore();
                }
                StoreOp::LPush { key, value } => {
                    pipe.lpush(self.ns(key), value).ignore();
                }
            }
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| {
                warn!(error = %e, "atomic durable-store write failed");
                e
            })
            .context("redis pipeline failed")
    }
}
