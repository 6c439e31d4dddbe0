// Session loader: byte pipeline first, engine-level URL racing as the fallback stage.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::orchestrator::ArtifactCache;
use crate::config::CacheConfig;
use crate::error::{LoadError, SourceFailure};
use crate::source::race::race_first_ok;

/// What the inference engine is asked to build a session from.
#[derive(Debug, Clone)]
pub enum ModelSource {
    Bytes(Bytes),
    Url(String),
}

/// Options handed to the engine untouched; unknown keys survive in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub execution_providers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intra_op_threads: Option<usize>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Binding to the inference engine that turns model bytes into a session.
#[async_trait]
pub trait EngineBinding: Send + Sync {
    type Session: Send;

    async fn create_session(
        &self,
        source: ModelSource,
        options: &SessionOptions,
    ) -> Result<Self::Session>;
}

/// Result of one loading stage.
enum StageOutcome<S> {
    Loaded(S),
    /// The stage could not produce a session; the next stage may.
    Failed(LoadError),
    /// The stage produced bytes the engine refused; no later stage can help.
    Rejected(LoadError),
}

pub struct ModelLoader<E: EngineBinding> {
    cache: Arc<ArtifactCache>,
    engine: Arc<E>,
    package_name: String,
    package_version: String,
    source_timeout: Option<Duration>,
}

impl<E: EngineBinding> ModelLoader<E> {
    pub fn new(cache: Arc<ArtifactCache>, engine: Arc<E>, config: &CacheConfig) -> Self {
        Self {
            cache,
            engine,
            package_name: config.package_name.clone(),
            package_version: config.package_version.clone(),
            source_timeout: config.source_timeout(),
        }
    }

    /// The model path followed by the package's CDN mirrors.
    pub fn candidate_urls(&self, model_path: &str) -> Result<Vec<String>, LoadError> {
        let file_name = file_name(model_path)?;
        Ok(vec![
            model_path.to_string(),
            format!(
                "https://cdn.jsdelivr.net/npm/{}@{}/dist/model/{}",
                self.package_name, self.package_version, file_name
            ),
            format!(
                "https://unpkg.com/{}@{}/dist/model/{}",
                self.package_name, self.package_version, file_name
            ),
        ])
    }

    /// Version-qualified cache key, so a new release never reads a stale entry.
    pub fn cache_key(&self, model_path: &str) -> Result<String, LoadError> {
        let file_name = file_name(model_path)?;
        Ok(format!(
            "{}@{}/{}",
            self.package_name, self.package_version, file_name
        ))
    }

    pub async fn load(
        &self,
        model_path: &str,
        options: &SessionOptions,
    ) -> Result<E::Session, LoadError> {
        let urls = self.candidate_urls(model_path)?;
        let key = self.cache_key(model_path)?;

        let byte_failure = match self.load_from_bytes(&urls, &key, options).await {
            StageOutcome::Loaded(session) => return Ok(session),
            StageOutcome::Rejected(e) => return Err(e),
            StageOutcome::Failed(e) => e,
        };
        warn!(
            key = key.as_str(),
            "byte pipeline failed, racing engine over urls: {}", byte_failure
        );

        match self.load_from_urls(&urls, options).await {
            StageOutcome::Loaded(session) => Ok(session),
            StageOutcome::Rejected(e) => Err(e),
            StageOutcome::Failed(engine_failure) => {
                Err(merge_failures(&key, byte_failure, engine_failure))
            }
        }
    }

    async fn load_from_bytes(
        &self,
        urls: &[String],
        key: &str,
        options: &SessionOptions,
    ) -> StageOutcome<E::Session> {
        let bytes = match self.cache.get_bytes(urls, key).await {
            Ok(bytes) => bytes,
            Err(e) => return StageOutcome::Failed(e),
        };

        match self
            .engine
            .create_session(ModelSource::Bytes(bytes), options)
            .await
        {
            Ok(session) => {
                info!(key, "session created from cached bytes");
                StageOutcome::Loaded(session)
            }
            Err(e) => StageOutcome::Rejected(LoadError::EngineConstructionFailed {
                locator: key.to_string(),
                reason: format!("{:#}", e),
            }),
        }
    }

    async fn load_from_urls(
        &self,
        urls: &[String],
        options: &SessionOptions,
    ) -> StageOutcome<E::Session> {
        let engine = self.engine.as_ref();
        let raced = race_first_ok(urls, self.source_timeout, |url| async move {
            engine.create_session(ModelSource::Url(url), options).await
        })
        .await;

        match raced {
            Ok(session) => StageOutcome::Loaded(session),
            Err(e) => StageOutcome::Failed(e),
        }
    }
}

fn file_name(model_path: &str) -> Result<&str, LoadError> {
    let path = model_path.trim();
    if path.is_empty() {
        return Err(LoadError::invalid_input("model path is empty"));
    }
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(LoadError::invalid_input(format!(
            "model path has no file name: {}",
            model_path
        ))),
    }
}

/// Combine both stages' failures; byte-layer causes come first as the most specific.
fn merge_failures(key: &str, byte_failure: LoadError, engine_failure: LoadError) -> LoadError {
    let mut failures = Vec::new();
    for stage in [byte_failure, engine_failure] {
        if stage.failures().is_empty() {
            failures.push(SourceFailure {
                url: key.to_string(),
                reason: stage.to_string(),
            });
        } else {
            failures.extend_from_slice(stage.failures());
        }
    }
    LoadError::AllSourcesFailed { failures }
}
