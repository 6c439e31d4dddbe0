use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use ma_model_cache::source::http_source::HttpSource;
use ma_model_cache::{ArtifactCache, ArtifactSource, CacheConfig, LoadError};

const MODEL_SIZE: usize = 256 * 1024;

fn model_bytes() -> Vec<u8> {
    (0..MODEL_SIZE).map(|i| (i % 251) as u8).collect()
}

async fn serve_model(State(hits): State<Arc<AtomicUsize>>) -> impl IntoResponse {
    hits.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        model_bytes(),
    )
}

async fn serve_missing() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

async fn start_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/model/detector.onnx", get(serve_model))
        .route("/missing/detector.onnx", get(serve_missing))
        .with_state(Arc::clone(&hits));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

#[tokio::test]
async fn test_http_source_fetch() {
    let (addr, hits) = start_server().await;
    let source = HttpSource::new();

    let data = source
        .fetch(&format!("http://{}/model/detector.onnx", addr))
        .await
        .unwrap();
    assert_eq!(data.len(), MODEL_SIZE);
    assert_eq!(&data[..], &model_bytes()[..]);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_http_source_rejects_error_status() {
    let (addr, _) = start_server().await;
    let source = HttpSource::new();

    let err = source
        .fetch(&format!("http://{}/missing/detector.onnx", addr))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("HTTP 404"));
}

#[tokio::test]
async fn test_artifact_cache_over_http_mirrors() {
    let (addr, hits) = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        cache_dir: Some(dir.path().to_path_buf()),
        ..CacheConfig::default()
    };
    let cache = ArtifactCache::new(&config);

    let candidates = vec![
        format!("http://{}/missing/detector.onnx", addr),
        format!("http://{}/model/detector.onnx", addr),
    ];
    let first = cache.get_bytes(&candidates, "detector@1").await.unwrap();
    let second = cache.get_bytes(&candidates, "detector@1").await.unwrap();

    assert_eq!(first.len(), MODEL_SIZE);
    assert_eq!(first, second);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    cache.cache().flush().await;
    assert!(dir.path().join("onnx-models/models").is_dir());
}

#[tokio::test]
async fn test_artifact_cache_all_mirrors_down() {
    // Bind then drop to get a port nobody listens on.
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = closed.local_addr().unwrap();
    drop(closed);
    let (addr, _) = start_server().await;

    let cache = ArtifactCache::new(&CacheConfig::default());
    let err = cache
        .get_bytes(
            &[
                format!("http://{}/model/detector.onnx", dead),
                format!("http://{}/missing/detector.onnx", addr),
            ],
            "detector@1",
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LoadError::AllSourcesFailed { .. }));
    assert_eq!(err.failures().len(), 2);
    assert!(err.failures().iter().any(|f| f.reason.contains("HTTP 404")));
}
