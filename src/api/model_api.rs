// Process-wide artifact cache shared by every caller in the process.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use crate::config::CacheConfig;
use crate::engine::orchestrator::ArtifactCache;
use crate::error::LoadError;

static DEFAULT_CACHE: OnceLock<Arc<ArtifactCache>> = OnceLock::new();

/// Initialize the shared cache. The first call wins; later configs are ignored.
pub fn init_cache(config: &CacheConfig) -> Arc<ArtifactCache> {
    Arc::clone(DEFAULT_CACHE.get_or_init(|| Arc::new(ArtifactCache::new(config))))
}

/// The shared cache, initialized with defaults (memory tier only) if nobody configured it.
pub fn shared_cache() -> Arc<ArtifactCache> {
    init_cache(&CacheConfig::default())
}

/// Artifact bytes for `key` through the shared cache.
pub async fn get_model_bytes(urls: &[String], key: &str) -> Result<Bytes, LoadError> {
    shared_cache().get_bytes(urls, key).await
}
