// Generation-named durable response cache used by the interception proxy.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// A response kept for replay: status, end-to-end headers and the body as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    url: String,
    status: u16,
    #[serde(default)]
    headers: Vec<(String, String)>,
    len: u64,
}

pub struct GenerationCache {
    root: PathBuf,
    prefix: String,
    name: String,
    dir: PathBuf,
}

impl GenerationCache {
    pub fn new(root: impl Into<PathBuf>, prefix: &str, generation: u32) -> Self {
        let root = root.into();
        let name = format!("{}v{}", prefix, generation);
        let dir = root.join(&name);
        Self {
            root,
            prefix: prefix.to_string(),
            name,
            dir,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the current generation.
    pub async fn install(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create cache generation {}", self.dir.display()))?;
        debug!("cache generation {} installed", self.name);
        Ok(())
    }

    /// Delete every older generation sharing our prefix. Returns the removed names.
    pub async fn activate(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("list {}", self.root.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&self.prefix) || name == self.name {
                continue;
            }
            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    info!("removed stale cache generation {}", name);
                    removed.push(name);
                }
                Err(e) => warn!("failed to remove stale cache generation {}: {}", name, e),
            }
        }
        Ok(removed)
    }

    pub async fn lookup(&self, key: &str) -> Option<CachedResponse> {
        match self.read_entry(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(key, "cache lookup failed, treating as miss: {:#}", e);
                None
            }
        }
    }

    /// Store `response` under `key`. The body lands before its metadata, so a
    /// reader never sees metadata pointing at a partial body.
    pub async fn store(&self, key: &str, url: &str, response: &CachedResponse) -> Result<()> {
        let (body_path, meta_path) = self.entry_paths(key);
        let meta = EntryMeta {
            url: url.to_string(),
            status: response.status,
            headers: response.headers.clone(),
            len: response.body.len() as u64,
        };
        let meta_json = serde_json::to_vec(&meta)?;

        write_atomic(&body_path, &response.body).await?;
        write_atomic(&meta_path, &meta_json).await?;
        debug!(key, len = response.body.len(), "response cached");
        Ok(())
    }

    async fn read_entry(&self, key: &str) -> Result<Option<CachedResponse>> {
        let (body_path, meta_path) = self.entry_paths(key);

        let raw_meta = match fs::read(&meta_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta: EntryMeta = serde_json::from_slice(&raw_meta).context("parse entry metadata")?;

        let body = match fs::read(&body_path).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if body.len() as u64 != meta.len {
            warn!(key, "cached body length mismatch, ignoring entry");
            return Ok(None);
        }

        Ok(Some(CachedResponse {
            status: meta.status,
            headers: meta.headers,
            body: Bytes::from(body),
        }))
    }

    fn entry_paths(&self, key: &str) -> (PathBuf, PathBuf) {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let stem = hex::encode(hasher.finalize());
        (
            self.dir.join(format!("{}.body", stem)),
            self.dir.join(format!("{}.json", stem)),
        )
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("tmp-{}-{}", std::process::id(), seq));
    fs::write(&tmp, data)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("commit {}", path.display()));
    }
    Ok(())
}
