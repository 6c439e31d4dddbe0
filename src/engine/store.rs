// Durable key -> bytes store on disk. Opened lazily once per process; every
// failure degrades to "absent" so the store can never fail a caller.

use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use memmap2::Mmap;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;

const VERSION_FILE: &str = "VERSION";

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// A store operation that was skipped or failed. The cause has already been
/// logged; callers only learn that nothing was persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ignored;

/// Open handle to the store's single collection.
#[derive(Debug)]
pub struct StoreHandle {
    collection_dir: PathBuf,
}

impl StoreHandle {
    pub fn collection_dir(&self) -> &Path {
        &self.collection_dir
    }

    /// On-disk location of the entry for `key`.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        self.collection_dir.join(hex::encode(hasher.finalize()))
    }
}

#[derive(Debug, Clone)]
struct StoreLocation {
    root: PathBuf,
    name: String,
    collection: String,
    schema_version: u32,
}

pub struct PersistentStore {
    location: Option<StoreLocation>,
    handle: OnceCell<Option<Arc<StoreHandle>>>,
}

impl PersistentStore {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        name: &str,
        collection: &str,
        schema_version: u32,
    ) -> Self {
        Self {
            location: Some(StoreLocation {
                root: cache_dir.into(),
                name: name.to_string(),
                collection: collection.to_string(),
                schema_version,
            }),
            handle: OnceCell::new(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        match &config.cache_dir {
            Some(dir) => Self::new(
                dir.clone(),
                &config.store_name,
                &config.collection,
                config.schema_version,
            ),
            None => Self::unavailable(),
        }
    }

    /// A store with no backing location; every read misses, every write is ignored.
    pub fn unavailable() -> Self {
        Self {
            location: None,
            handle: OnceCell::new(),
        }
    }

    /// Open the store, running the schema upgrade on first use.
    ///
    /// The open itself is memoized, so concurrent callers all await the same
    /// attempt and observe the same handle or the same `None`.
    pub async fn open(&self) -> Option<Arc<StoreHandle>> {
        self.handle
            .get_or_init(|| async {
                let Some(location) = &self.location else {
                    debug!("no cache directory configured, durable store unavailable");
                    return None;
                };
                match open_layout(location).await {
                    Ok(handle) => {
                        info!(
                            "durable store opened at {}",
                            handle.collection_dir.display()
                        );
                        Some(Arc::new(handle))
                    }
                    Err(e) => {
                        warn!("durable store unavailable: {:#}", e);
                        None
                    }
                }
            })
            .await
            .clone()
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let handle = self.open().await?;
        let path = handle.entry_path(key);

        match tokio::task::spawn_blocking(move || read_entry(&path)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(key, "store read failed, treating as absent: {:#}", e);
                None
            }
            Err(e) => {
                warn!(key, "store read task failed: {}", e);
                None
            }
        }
    }

    pub async fn put(&self, key: &str, bytes: Bytes) -> Result<(), Ignored> {
        let Some(handle) = self.open().await else {
            return Err(Ignored);
        };

        match write_entry(&handle, key, &bytes).await {
            Ok(()) => {
                debug!(key, len = bytes.len(), "store entry written");
                Ok(())
            }
            Err(e) => {
                warn!(key, "store write ignored: {:#}", e);
                Err(Ignored)
            }
        }
    }
}

async fn open_layout(location: &StoreLocation) -> Result<StoreHandle> {
    let db_dir = location.root.join(&location.name);
    fs::create_dir_all(&db_dir)
        .await
        .with_context(|| format!("create {}", db_dir.display()))?;

    let version_path = db_dir.join(VERSION_FILE);
    let current = match fs::read_to_string(&version_path).await {
        // An unreadable marker is treated like a fresh store.
        Ok(raw) => raw.trim().parse::<u32>().unwrap_or(0),
        Err(e) if e.kind() == ErrorKind::NotFound => 0,
        Err(e) => return Err(e).context("read store version"),
    };

    if current > location.schema_version {
        bail!(
            "store schema version {} is newer than supported {}",
            current,
            location.schema_version
        );
    }

    let collection_dir = db_dir.join(&location.collection);
    if current < location.schema_version {
        info!(
            from = current,
            to = location.schema_version,
            "upgrading durable store, creating collection {}",
            location.collection
        );
        fs::create_dir_all(&collection_dir)
            .await
            .context("create collection")?;
        fs::write(&version_path, location.schema_version.to_string())
            .await
            .context("write store version")?;
    } else if !fs::try_exists(&collection_dir).await.unwrap_or(false) {
        fs::create_dir_all(&collection_dir)
            .await
            .context("recreate collection")?;
    }

    Ok(StoreHandle { collection_dir })
}

fn read_entry(path: &Path) -> Result<Option<Bytes>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }

    // SAFETY: entries are only ever replaced by rename, never rewritten in place.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(Some(Bytes::copy_from_slice(&mmap)))
}

async fn write_entry(handle: &StoreHandle, key: &str, bytes: &[u8]) -> Result<()> {
    let path = handle.entry_path(key);
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("tmp-{}-{}", std::process::id(), seq));

    if let Err(e) = fs::write(&tmp, bytes).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e).context("write temp entry");
    }
    if let Err(e) = fs::rename(&tmp, &path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e).context("commit entry");
    }
    Ok(())
}
