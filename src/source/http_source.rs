use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Url};
use tracing::{debug, warn};

use super::traits::ArtifactSource;

/// Plain HTTP(S) artifact source over a shared connection pool.
#[derive(Clone)]
pub struct HttpSource {
    client: Client,
    base_url: Option<String>,
}

impl Default for HttpSource {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpSource {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: None,
        }
    }

    /// Resolve relative locators such as `/models/detector.onnx` against `base_url`.
    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }

    fn resolve(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(e) => {
                let base = self
                    .base_url
                    .as_deref()
                    .ok_or_else(|| anyhow!("relative URL without a base url: {} ({})", url, e))?;
                Url::parse(base)
                    .with_context(|| format!("invalid base url {}", base))?
                    .join(url)
                    .with_context(|| format!("cannot resolve {} against {}", url, base))
            }
        }
    }
}

#[async_trait]
impl ArtifactSource for HttpSource {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        let target = self.resolve(url)?;
        let resp = self.client.get(target).send().await?;

        let status = resp.status();
        if !status.is_success() {
            warn!("artifact fetch failed status={} url={}", status.as_u16(), url);
            return Err(anyhow!("HTTP {}: {}", status.as_u16(), url));
        }

        let bytes = resp.bytes().await?;
        debug!("artifact fetched url={} len={}", url, bytes.len());
        Ok(bytes)
    }
}
