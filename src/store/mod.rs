// =============================================================================
// DurableStore — namespaced K/V capability contract
// =============================================================================
//
// Not a specific engine: a capability contract over hashes, sets, lists, and
// a transactional `atomic` block, keyed `<ns>:<category>:<id>` per spec §4.3.
// Concrete backends live in sibling modules: `redis_store` (the production
// backend) and `null_store` (in-memory no-op, used when the store degrades
// or in tests).
// =============================================================================

pub mod null_store;
pub mod redis_store;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::types::Tick;

pub use null_store::NullStore;
pub use redis_store::RedisStore;

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn hset(&self, key: &str, field: &str, value: &str) -> anyhow::Result<()>;
    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> anyhow::Result<HashMap<String, String>>;
    async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<()>;
    async fn srem(&self, key: &str, member: &str) -> anyhow::Result<()>;
    async fn smembers(&self, key: &str) -> anyhow::Result<Vec<String>>;
    async fn lpush(&self, key: &str, value: &str) -> anyhow::Result<()>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> anyhow::Result<Vec<String>>;
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> anyhow::Result<()>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> anyhow::Result<()>;

    /// Group a sequence of writes so that they either all apply or none do.
    async fn atomic(&self, ops: Vec<StoreOp>) -> anyhow::Result<()>;

    /// Convenience hook used by `TickCache` to mirror every put; the default
    /// implementation writes the LTP snapshot hash with a 5-minute TTL.
    async fn write_through_tick(&self, tick: &Tick) -> anyhow::Result<()> {
        let key = "ltp:snapshot";
        let field = format!("{}:{}", tick.segment, tick.security_id);
        self.hset(key, &field, &tick.ltp.to_string()).await?;
        self.expire(key, 300).await
    }
}

/// One write inside an `atomic` block.
#[derive(Debug, Clone)]
pub enum StoreOp {
    HSet { key: String, field: String, value: String },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    LPush { key: String, value: String },
}
