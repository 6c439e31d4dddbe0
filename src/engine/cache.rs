// Two-tier byte cache: an in-process map over the durable store.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio_util::task::TaskTracker;
use tracing::debug;

use super::stats::CacheStats;
use super::store::PersistentStore;

#[derive(Clone)]
pub struct TieredCache {
    inner: Arc<Inner>,
}

struct Inner {
    memory: RwLock<HashMap<String, Bytes>>,
    store: Arc<PersistentStore>,
    writes: TaskTracker,
    stats: Arc<CacheStats>,
}

impl TieredCache {
    pub fn new(store: Arc<PersistentStore>, stats: Arc<CacheStats>) -> Self {
        Self {
            inner: Arc::new(Inner {
                memory: RwLock::new(HashMap::new()),
                store,
                writes: TaskTracker::new(),
                stats,
            }),
        }
    }

    /// Look `key` up in memory, then in the durable store.
    ///
    /// A store hit is promoted into memory so the next lookup stays in-process.
    pub async fn lookup(&self, key: &str) -> Option<Bytes> {
        if let Some(bytes) = self.peek_memory(key) {
            self.inner.stats.record_memory_hit();
            return Some(bytes);
        }

        match self.inner.store.get(key).await {
            Some(bytes) => {
                debug!(key, len = bytes.len(), "promoting store hit to memory");
                self.inner.stats.record_store_hit();
                self.inner
                    .memory
                    .write()
                    .insert(key.to_string(), bytes.clone());
                Some(bytes)
            }
            None => {
                self.inner.stats.record_miss();
                None
            }
        }
    }

    /// Memory tier only; never touches the store.
    pub fn peek_memory(&self, key: &str) -> Option<Bytes> {
        self.inner.memory.read().get(key).cloned()
    }

    /// Make `bytes` visible to lookups immediately and persist them in the background.
    ///
    /// The durable write is fire-and-forget: its outcome is only logged.
    /// Must be called from within a Tokio runtime.
    pub fn populate(&self, key: &str, bytes: Bytes) {
        self.inner
            .memory
            .write()
            .insert(key.to_string(), bytes.clone());

        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        self.inner.writes.spawn(async move {
            if inner.store.put(&key, bytes).await.is_err() {
                inner.stats.record_store_write_ignored();
            }
        });
    }

    /// Wait for every background store write scheduled so far.
    pub async fn flush(&self) {
        self.inner.writes.close();
        self.inner.writes.wait().await;
        self.inner.writes.reopen();
    }

    pub fn memory_len(&self) -> usize {
        self.inner.memory.read().len()
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.inner.store
    }
}
