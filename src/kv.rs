use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
}

/// Low-latency key-value store: idempotency records, quotes, hot risk mode.
///
/// Every value is an opaque string (JSON at the call sites). All writes carry
/// a TTL; nothing in this keyspace is kept forever.
#[async_trait]
pub trait KeyValue: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError>;

    /// Sets the key only if absent. Returns `true` if this call set it.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, KvError>;

    /// Atomically reads and removes the key (single-consumer semantics).
    async fn get_del(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    async fn ping(&self) -> Result<(), KvError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests, local runs without Redis)
// ---------------------------------------------------------------------------

/// Dashmap-backed store with lazy TTL checks plus a periodic sweep.
pub struct MemoryKv {
    entries: DashMap<String, (String, u64)>, // (value, expires_at_epoch)
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Spawns a background task that periodically evicts expired entries.
    pub fn spawn_eviction_task(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let now = now_epoch();
                let before = store.entries.len();
                store.entries.retain(|_, (_, expires)| *expires > now);
                let evicted = before - store.entries.len();
                if evicted > 0 {
                    debug!(evicted, "kv eviction sweep complete");
                }
            }
        });
    }

    fn live_value(entry: &(String, u64)) -> Option<String> {
        if entry.1 > now_epoch() {
            Some(entry.0.clone())
        } else {
            None
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValue for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.entries.get(key).and_then(|e| Self::live_value(&e)))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        self.entries
            .insert(key.to_string(), (value.to_string(), now_epoch() + ttl_secs));
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, KvError> {
        use dashmap::mapref::entry::Entry;
        // Entry API serializes concurrent callers on the shard lock, so
        // exactly one SET NX wins.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occ) => {
                if Self::live_value(occ.get()).is_some() {
                    Ok(false)
                } else {
                    occ.insert((value.to_string(), now_epoch() + ttl_secs));
                    Ok(true)
                }
            }
            Entry::Vacant(vac) => {
                vac.insert((value.to_string(), now_epoch() + ttl_secs));
                Ok(true)
            }
        }
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self
            .entries
            .remove(key)
            .and_then(|(_, entry)| Self::live_value(&entry)))
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

pub struct RedisKv {
    client: redis::Client,
}

impl RedisKv {
    pub fn new(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url).map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, KvError> {
        self.client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }
}

#[async_trait]
impl KeyValue for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;
        // SET NX EX returns OK only when the key was newly set.
        let was_set: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(was_set)
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn().await?;
        redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_set_get_delete() {
        let kv = MemoryKv::new();
        kv.set_ex("k1", "v1", 60).await.unwrap();
        assert_eq!(kv.get("k1").await.unwrap().as_deref(), Some("v1"));

        kv.delete("k1").await.unwrap();
        assert_eq!(kv.get("k1").await.unwrap(), None);
        assert_eq!(kv.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_set_nx() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx_ex("k", "first", 60).await.unwrap());
        assert!(!kv.set_nx_ex("k", "second", 60).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_memory_get_del_single_consumer() {
        let kv = MemoryKv::new();
        kv.set_ex("quote", "body", 60).await.unwrap();
        assert_eq!(kv.get_del("quote").await.unwrap().as_deref(), Some("body"));
        assert_eq!(kv.get_del("quote").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_expiry() {
        let kv = MemoryKv::new();
        // ttl 0 expires immediately relative to the epoch-seconds clock
        kv.set_ex("dead", "v", 0).await.unwrap();
        assert_eq!(kv.get("dead").await.unwrap(), None);
        // an expired key can be re-claimed by SET NX
        assert!(kv.set_nx_ex("dead", "v2", 60).await.unwrap());
    }
}
