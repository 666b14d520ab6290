// src/cache.rs
//! Short-TTL content cache. Keys follow the `kind:identifier` convention
//! (`html:<url>`, `selector:<source>`, `metadata:<source>`, `judge:<hash>`).
//! A missing or disabled cache degrades to "always miss", never to an error.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn put(&self, key: &str, value: String, ttl: Duration);
}

pub type SharedCache = Arc<dyn Cache>;

pub fn html_key(url: &str) -> String {
    format!("html:{url}")
}

pub fn selector_key(source_id: i64) -> String {
    format!("selector:{source_id}")
}

pub fn metadata_key(source_id: i64) -> String {
    format!("metadata:{source_id}")
}

pub fn judge_key(pair_hash: &str) -> String {
    format!("judge:{pair_hash}")
}

/// In-process cache with per-entry expiry. Expired entries are dropped
/// lazily on read and swept opportunistically on write.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Instant, String)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn shared() -> SharedCache {
        Arc::new(Self::new())
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((expires, value)) if *expires > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if entries.len() > 4096 {
            entries.retain(|_, (expires, _)| *expires > now);
        }
        entries.insert(key.to_string(), (now + ttl, value));
    }
}

/// Always-miss cache used when caching is disabled.
pub struct NoopCache;

impl NoopCache {
    pub fn shared() -> SharedCache {
        Arc::new(NoopCache)
    }
}

#[async_trait]
impl Cache for NoopCache {
    async fn get(&self, _key: &str) -> Option<String> {
        None
    }

    async fn put(&self, _key: &str, _value: String, _ttl: Duration) {}
}
