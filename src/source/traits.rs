use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Something that can retrieve the full body of an artifact URL.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Fetch `url` in full. Any non-success status is an error, never bytes.
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}
