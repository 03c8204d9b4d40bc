// =============================================================================
// NullStore — in-memory no-op DurableStore
// =============================================================================
//
// Backs the degraded-to-memory-only mode (spec §7 `StoreUnavailable`) and
// unit tests that don't want a live redis instance. Still honors the
// hash/set/list contract so callers exercising it in tests see realistic
// behavior, just without any persistence across process restarts.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DurableStore, StoreOp};

#[derive(Default)]
struct Inner {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    lists: HashMap<String, VecDeque<String>>,
}

pub struct NullStore {
    inner: Mutex<Inner>,
}

impl NullStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for NullStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for NullStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let inner = self.inner.lock();
        Ok(inner.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let inner = self.inner.lock();
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let list = match inner.lists.get(key) {
            Some(l) => l,
            None => return Ok(Vec::new()),
        };
        let len = list.len() as isize;
        let norm = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len)
            }
        };
        let start = norm(start) as usize;
        let stop = (norm(stop) + 1).max(0) as usize;
        Ok(list
            .iter()
            .skip(start)
            .take(stop.saturating_sub(start))
            .cloned()
            .collect())
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let trimmed = self.lrange(key, start, stop).await?;
        let mut inner = self.inner.lock();
        inner.lists.insert(key.to_string(), trimmed.into());
        Ok(())
    }

    async fn expire(&self, _key: &str, _ttl_secs: u64) -> Result<()> {
        // No TTL semantics for an in-memory store; entries live for the
        // process lifetime.
        Ok(())
    }

    async fn atomic(&self, ops: Vec<StoreOp>) -> Result<()> {
        for op in ops {
            match op {
                StoreOp::HSet { key, field, value } => self.hset(&key, &field, &value).await?,
                StoreOp::SAdd { key, member } => self.sadd(&key, &member).await?,
                StoreOp::SRem { key, member } => self.srem(&key, &member).await?,
                StoreOp::LPush { key, value } => self.lpush(&key, &value).await?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_roundtrip() {
        let store = NullStore::new();
        store.hset("pos:1", "buy_qty", "75").await.unwrap();
        assert_eq!(
            store.hget("pos:1", "buy_qty").await.unwrap(),
            Some("75".to_string())
        );
    }

    #[tokio::test]
    async fn set_add_remove() {
        let store = NullStore::new();
        store.sadd("pos:open", "p1").await.unwrap();
        store.sadd("pos:open", "p2").await.unwrap();
        store.srem("pos:open", "p1").await.unwrap();
        let members = store.smembers("pos:open").await.unwrap();
        assert_eq!(members, vec!["p2".to_string()]);
    }

    #[tokio::test]
    async fn list_push_and_range() {
        let store = NullStore::new();
        store.lpush("orders:paper:s1", "o3").await.unwrap();
        store.lpush("orders:paper:s1", "o2").await.unwrap();
        store.lpush("orders:paper:s1", "o1").await.unwrap();
        let all = store.lrange("orders:paper:s1", 0, -1).await.unwrap();
        assert_eq!(all, vec!["o1", "o2", "o3"]);
    }

    #[tokio::test]
    async fn atomic_applies_all_ops() {
        let store = NullStore::new();
        store
            .atomic(vec![
                StoreOp::HSet {
                    key: "pos:1".into(),
                    field: "net_qty".into(),
                    value: "0".into(),
                },
                StoreOp::SRem {
                    key: "pos:open".into(),
                    member: "1".into(),
                },
            ])
            .await
            .unwrap();
        assert_eq!(
            store.hget("pos:1", "net_qty").await.unwrap(),
            Some("0".to_string())
        );
    }
}
