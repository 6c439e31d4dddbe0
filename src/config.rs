use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Name of the durable byte store under the cache directory.
pub const DEFAULT_STORE_NAME: &str = "onnx-models";

/// The single collection inside the durable store.
pub const DEFAULT_COLLECTION: &str = "models";

/// Schema version of the durable store layout. Bumping it triggers the
/// collection-creation step on next open; entries are not migrated.
pub const STORE_SCHEMA_VERSION: u32 = 1;

/// Default bound on a single racing source (5 minutes).
pub const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 300;

/// File extension the interception proxy applies its cache policy to.
pub const ARTIFACT_EXTENSION: &str = ".onnx";

/// Prefix shared by every interception cache generation directory.
pub const INTERCEPT_CACHE_PREFIX: &str = "onnx-models-";

/// Current interception cache generation. Bump to drop every older generation on activate.
pub const INTERCEPT_CACHE_GENERATION: u32 = 1;

/// Configuration for the artifact cache and session loader.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory of the durable store. `None` means no durable tier.
    pub cache_dir: Option<PathBuf>,
    pub store_name: String,
    pub collection: String,
    pub schema_version: u32,
    /// Per-source bound for racing fetches, in seconds. `None` disables it.
    pub source_timeout_secs: Option<u64>,
    /// Package identity used to derive mirror URLs and cache keys.
    pub package_name: String,
    pub package_version: String,
    /// Origin that relative model paths are resolved against, e.g. `http://127.0.0.1:8080/`.
    pub base_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            store_name: DEFAULT_STORE_NAME.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            schema_version: STORE_SCHEMA_VERSION,
            source_timeout_secs: Some(DEFAULT_SOURCE_TIMEOUT_SECS),
            package_name: env!("CARGO_PKG_NAME").to_string(),
            package_version: env!("CARGO_PKG_VERSION").to_string(),
            base_url: None,
        }
    }
}

impl CacheConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("invalid cache config")
    }

    pub fn source_timeout(&self) -> Option<Duration> {
        self.source_timeout_secs.map(Duration::from_secs)
    }
}

/// Configuration for the interception proxy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
    /// Directory holding the generation-named cache directories.
    pub cache_root: PathBuf,
    /// Origin every request is forwarded to, e.g. `http://127.0.0.1:8080`.
    pub upstream: String,
    pub generation: u32,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            cache_root: std::env::temp_dir().join("ma-model-cache"),
            upstream: String::new(),
            generation: INTERCEPT_CACHE_GENERATION,
        }
    }
}
