use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;

use ma_model_cache::engine::store::PersistentStore;
use ma_model_cache::{ArtifactCache, ArtifactSource, LoadError};

/// Fake network: per-URL delay and body, counting every fetch.
struct FakeNetwork {
    routes: HashMap<String, (u64, Option<Bytes>)>,
    fetches: AtomicUsize,
}

impl FakeNetwork {
    fn new(routes: &[(&str, u64, Option<&'static [u8]>)]) -> Arc<Self> {
        Arc::new(Self {
            routes: routes
                .iter()
                .map(|(url, delay, body)| (url.to_string(), (*delay, body.map(Bytes::from_static))))
                .collect(),
            fetches: AtomicUsize::new(0),
        })
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactSource for FakeNetwork {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let (delay, body) = self
            .routes
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("no route: {}", url))?;
        tokio::time::sleep(Duration::from_millis(delay)).await;
        body.ok_or_else(|| anyhow!("HTTP 503: {}", url))
    }
}

fn urls(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn durable_store(dir: &std::path::Path) -> Arc<PersistentStore> {
    Arc::new(PersistentStore::new(dir, "onnx-models", "models", 1))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_download_once() {
    let network = FakeNetwork::new(&[
        ("http://local/det.onnx", 80, Some(b"detector-weights")),
        ("http://mirror/det.onnx", 120, Some(b"detector-weights")),
    ]);
    let cache = Arc::new(ArtifactCache::with_parts(
        Arc::new(PersistentStore::unavailable()),
        network.clone(),
        None,
    ));
    let candidates = urls(&["http://local/det.onnx", "http://mirror/det.onnx"]);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let cache = Arc::clone(&cache);
        let candidates = candidates.clone();
        tasks.push(tokio::spawn(async move {
            cache.get_bytes(&candidates, "det@1.0.0").await
        }));
    }

    for t in tasks {
        assert_eq!(t.await.unwrap().unwrap(), &b"detector-weights"[..]);
    }
    let stats = cache.stats();
    assert_eq!(stats.races, 1);
    // One race issues one fetch per candidate, nothing more.
    assert_eq!(network.fetches(), 2);
    assert_eq!(cache.ledger().pending_count(), 0);
}

#[tokio::test]
async fn test_second_call_is_a_cache_hit() {
    let network = FakeNetwork::new(&[("http://local/lm.onnx", 0, Some(b"landmarks"))]);
    let cache = ArtifactCache::with_parts(
        Arc::new(PersistentStore::unavailable()),
        network.clone(),
        None,
    );
    let candidates = urls(&["http://local/lm.onnx"]);

    let first = cache.get_bytes(&candidates, "lm@2").await.unwrap();
    let second = cache.get_bytes(&candidates, "lm@2").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(network.fetches(), 1);
    assert_eq!(cache.stats().memory_hits, 1);
}

#[tokio::test]
async fn test_durable_tier_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let payload: &'static [u8] = b"\x00\x01liveness-model\xff";

    {
        let network = FakeNetwork::new(&[("http://local/live.onnx", 0, Some(payload))]);
        let cache = ArtifactCache::with_parts(durable_store(dir.path()), network, None);
        cache
            .get_bytes(&urls(&["http://local/live.onnx"]), "live@3")
            .await
            .unwrap();
        cache.cache().flush().await;
    }

    // Fresh process: empty memory tier, network down.
    let offline = FakeNetwork::new(&[]);
    let cache = ArtifactCache::with_parts(durable_store(dir.path()), offline.clone(), None);
    let bytes = cache
        .get_bytes(&urls(&["http://local/live.onnx"]), "live@3")
        .await
        .unwrap();

    assert_eq!(bytes, payload);
    assert_eq!(offline.fetches(), 0);
    let stats = cache.stats();
    assert_eq!(stats.store_hits, 1);
    assert_eq!(stats.races, 0);
}

#[tokio::test]
async fn test_new_version_key_does_not_reuse_old_entry() {
    let network = FakeNetwork::new(&[("http://local/m.onnx", 0, Some(b"v2"))]);
    let cache = ArtifactCache::with_parts(
        Arc::new(PersistentStore::unavailable()),
        network.clone(),
        None,
    );
    cache.cache().populate("m@1", Bytes::from_static(b"v1"));

    let bytes = cache
        .get_bytes(&urls(&["http://local/m.onnx"]), "m@2")
        .await
        .unwrap();
    assert_eq!(bytes, &b"v2"[..]);
    assert_eq!(network.fetches(), 1);
}

#[tokio::test]
async fn test_unavailable_store_still_downloads() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();

    let network = FakeNetwork::new(&[("http://local/m.onnx", 0, Some(b"weights"))]);
    let cache = ArtifactCache::with_parts(durable_store(&blocker), network.clone(), None);

    let bytes = cache
        .get_bytes(&urls(&["http://local/m.onnx"]), "m@1")
        .await
        .unwrap();
    assert_eq!(bytes, &b"weights"[..]);

    cache.cache().flush().await;
    assert_eq!(cache.stats().store_writes_ignored, 1);
}

#[tokio::test]
async fn test_fast_mirror_wins_without_waiting_for_slow_failure() {
    let network = FakeNetwork::new(&[
        ("http://local/m.onnx", 3_000, None),
        ("http://cdn/m.onnx", 20, Some(b"from-cdn")),
    ]);
    let cache = ArtifactCache::with_parts(
        Arc::new(PersistentStore::unavailable()),
        network,
        None,
    );

    let started = Instant::now();
    let bytes = cache
        .get_bytes(&urls(&["http://local/m.onnx", "http://cdn/m.onnx"]), "m@1")
        .await
        .unwrap();
    assert_eq!(bytes, &b"from-cdn"[..]);
    assert!(started.elapsed() < Duration::from_millis(1_500));
}

#[tokio::test]
async fn test_all_sources_failing_reports_causes() {
    let network = FakeNetwork::new(&[
        ("http://local/m.onnx", 0, None),
        ("http://cdn/m.onnx", 10, None),
    ]);
    let cache = ArtifactCache::with_parts(
        Arc::new(PersistentStore::unavailable()),
        network,
        None,
    );

    let err = cache
        .get_bytes(&urls(&["http://local/m.onnx", "http://cdn/m.onnx"]), "m@1")
        .await
        .unwrap_err();

    match &err {
        LoadError::AllSourcesFailed { failures } => {
            assert_eq!(failures.len(), 2);
            assert!(failures.iter().any(|f| f.reason.contains("HTTP 503")));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("HTTP 503"));

    // Failures are not cached: nothing in memory, no pending ticket.
    assert!(cache.cache().peek_memory("m@1").is_none());
    assert_eq!(cache.ledger().pending_count(), 0);
}

#[tokio::test]
async fn test_invalid_input_fails_before_any_fetch() {
    let network = FakeNetwork::new(&[("http://local/m.onnx", 0, Some(b"weights"))]);
    let cache = ArtifactCache::with_parts(
        Arc::new(PersistentStore::unavailable()),
        network.clone(),
        None,
    );

    let err = cache
        .get_bytes(&urls(&["http://local/m.onnx"]), "")
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::InvalidInput(_)));

    let err = cache.get_bytes(&[], "m@1").await.unwrap_err();
    assert!(matches!(err, LoadError::InvalidInput(_)));

    assert_eq!(network.fetches(), 0);
}
