// Acquisition counters: tier hits, misses, races and downloaded volume.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub memory_hits: u64,
    pub store_hits: u64,
    pub misses: u64,
    pub races: u64,
    pub source_attempts: u64,
    pub downloaded_bytes: u64,
    pub store_writes_ignored: u64,
}

#[derive(Default)]
pub struct CacheStats {
    memory_hits: AtomicU64,
    store_hits: AtomicU64,
    misses: AtomicU64,
    races: AtomicU64,
    source_attempts: AtomicU64,
    downloaded_bytes: AtomicU64,
    store_writes_ignored: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_hit(&self) {
        self.store_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// One race over the candidate list was started.
    pub fn record_race(&self) {
        self.races.fetch_add(1, Ordering::Relaxed);
    }

    /// One candidate URL was fetched (win or lose).
    pub fn record_source_attempt(&self) {
        self.source_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_store_write_ignored(&self) {
        self.store_writes_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            store_hits: self.store_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            races: self.races.load(Ordering::Relaxed),
            source_attempts: self.source_attempts.load(Ordering::Relaxed),
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            store_writes_ignored: self.store_writes_ignored.load(Ordering::Relaxed),
        }
    }
}
