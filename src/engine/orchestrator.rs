// Artifact acquisition: cache check, dedup gate, race fetch, write-back.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use super::cache::TieredCache;
use super::ledger::InFlightLedger;
use super::stats::{CacheStats, CacheStatsSnapshot};
use super::store::PersistentStore;
use crate::config::CacheConfig;
use crate::error::LoadError;
use crate::source::http_source::HttpSource;
use crate::source::race::race_bytes;
use crate::source::traits::ArtifactSource;

pub struct ArtifactCache {
    cache: TieredCache,
    ledger: InFlightLedger,
    source: Arc<dyn ArtifactSource>,
    stats: Arc<CacheStats>,
    source_timeout: Option<Duration>,
}

impl ArtifactCache {
    /// Cache over HTTP sources and the durable store described by `config`.
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_parts(
            Arc::new(PersistentStore::from_config(config)),
            Arc::new(HttpSource::new().with_base_url(config.base_url.clone())),
            config.source_timeout(),
        )
    }

    pub fn with_parts(
        store: Arc<PersistentStore>,
        source: Arc<dyn ArtifactSource>,
        source_timeout: Option<Duration>,
    ) -> Self {
        let stats = Arc::new(CacheStats::new());
        Self {
            cache: TieredCache::new(store, Arc::clone(&stats)),
            ledger: InFlightLedger::new(),
            source,
            stats,
            source_timeout,
        }
    }

    /// Bytes of the artifact `key`, downloaded from the fastest of `urls` at most once.
    ///
    /// `key` must identify the artifact version; entries are never invalidated.
    pub async fn get_bytes(&self, urls: &[String], key: &str) -> Result<Bytes, LoadError> {
        validate_request(urls, key)?;

        if let Some(bytes) = self.cache.lookup(key).await {
            debug!(key, "artifact served from cache");
            return Ok(bytes);
        }

        let cache = self.cache.clone();
        let source = Arc::clone(&self.source);
        let stats = Arc::clone(&self.stats);
        let urls = urls.to_vec();
        let owned_key = key.to_string();
        let source_timeout = self.source_timeout;

        self.ledger
            .acquire(key, move || async move {
                // A previous acquisition may have settled since our lookup.
                if let Some(bytes) = cache.peek_memory(&owned_key) {
                    return Ok(bytes);
                }

                stats.record_race();
                info!(key = owned_key.as_str(), sources = urls.len(), "downloading artifact");
                let counted = CountingSource {
                    inner: source.as_ref(),
                    stats: &stats,
                };
                let bytes = race_bytes(&counted, &urls, source_timeout).await?;

                stats.record_downloaded(bytes.len() as u64);
                cache.populate(&owned_key, bytes.clone());
                Ok(bytes)
            })
            .await
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    pub fn ledger(&self) -> &InFlightLedger {
        &self.ledger
    }
}

/// Reject requests that cannot name an artifact, before any I/O happens.
pub fn validate_request(urls: &[String], key: &str) -> Result<(), LoadError> {
    if key.trim().is_empty() {
        return Err(LoadError::invalid_input("artifact key is empty"));
    }
    if urls.is_empty() {
        return Err(LoadError::invalid_input("no candidate urls"));
    }
    if urls.iter().any(|u| u.trim().is_empty()) {
        return Err(LoadError::invalid_input("candidate url is empty"));
    }
    Ok(())
}

struct CountingSource<'a> {
    inner: &'a dyn ArtifactSource,
    stats: &'a CacheStats,
}

#[async_trait::async_trait]
impl<'a> ArtifactSource for CountingSource<'a> {
    async fn fetch(&self, url: &str) -> anyhow::Result<Bytes> {
        self.stats.record_source_attempt();
        self.inner.fetch(url).await
    }
}
