// Axum interception proxy: serves artifact requests cache-first, forwards everything else.

use std::sync::Arc;

use anyhow::{bail, Result};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use reqwest::Client;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::generation::{CachedResponse, GenerationCache};
use crate::config::{InterceptConfig, ARTIFACT_EXTENSION, INTERCEPT_CACHE_PREFIX};

#[derive(Clone)]
struct ProxyState {
    upstream: Arc<str>,
    client: Client,
    cache: Arc<GenerationCache>,
}

impl ProxyState {
    fn upstream_url(&self, uri: &Uri) -> String {
        let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("{}{}", self.upstream, path)
    }
}

pub struct InterceptionProxy {
    port: u16,
    cache_name: String,
    shutdown: CancellationToken,
}

impl InterceptionProxy {
    /// Install and activate the current cache generation, then start serving on a random port.
    ///
    /// Older generations are gone before the first request is accepted.
    pub async fn start(config: &InterceptConfig) -> Result<Self> {
        let upstream = config.upstream.trim().trim_end_matches('/');
        if upstream.is_empty() {
            bail!("interception proxy needs an upstream origin");
        }

        let cache =
            GenerationCache::new(&config.cache_root, INTERCEPT_CACHE_PREFIX, config.generation);
        cache.install().await?;
        match cache.activate().await {
            Ok(removed) if !removed.is_empty() => {
                info!("activated {} (removed {:?})", cache.name(), removed)
            }
            Ok(_) => debug!("activated {}", cache.name()),
            Err(e) => warn!("stale generation cleanup failed: {:#}", e),
        }

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let cache_name = cache.name().to_string();

        let state = ProxyState {
            upstream: Arc::from(upstream),
            client: Client::new(),
            cache: Arc::new(cache),
        };
        let app = Router::new().fallback(intercept_handler).with_state(state);

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
                .ok();
        });

        info!("interception proxy listening on 127.0.0.1:{} cache={}", port, cache_name);
        Ok(Self {
            port,
            cache_name,
            shutdown,
        })
    }

    /// Like [`start`](Self::start), but a failure only means "no interception layer".
    pub async fn try_start(config: &InterceptConfig) -> Option<Self> {
        match Self::start(config).await {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                warn!("interception proxy not started: {:#}", e);
                None
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Proxy URL for a root-relative `path`.
    pub fn url_for(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}/{}", self.port, path.trim_start_matches('/'))
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn shutdown(self) {
        self.shutdown.cancel();
    }
}

fn is_artifact_path(path: &str) -> bool {
    path.ends_with(ARTIFACT_EXTENSION)
}

/// Copy `headers` without the ones that only describe a single hop.
fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in [
        header::CONNECTION,
        header::HOST,
        header::TRANSFER_ENCODING,
        header::CONTENT_LENGTH,
        header::UPGRADE,
        header::TE,
        header::TRAILER,
        header::PROXY_AUTHORIZATION,
    ] {
        out.remove(name);
    }
    out
}

async fn intercept_handler(State(state): State<ProxyState>, req: Request) -> Response {
    if req.method() != Method::GET || !is_artifact_path(req.uri().path()) {
        return forward(&state, req).await;
    }

    let key = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    if let Some(hit) = state.cache.lookup(&key).await {
        debug!("artifact cache hit {}", key);
        return cached_response(hit);
    }

    let url = state.upstream_url(req.uri());
    let sent = state
        .client
        .get(&url)
        .headers(forwardable_headers(req.headers()))
        .send()
        .await;

    let resp = match sent {
        Ok(resp) => resp,
        Err(e) => return network_fallback(&state, &key, e.into()).await,
    };
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = match resp.bytes().await {
        Ok(body) => body,
        Err(e) => return network_fallback(&state, &key, e.into()).await,
    };

    if status == StatusCode::OK {
        let copy = CachedResponse {
            status: status.as_u16(),
            headers: replay_headers(&headers),
            body: body.clone(),
        };
        if let Err(e) = state.cache.store(&key, &url, &copy).await {
            warn!("failed to cache {}: {:#}", key, e);
        }
    } else {
        debug!("not caching {} status={}", key, status.as_u16());
    }

    upstream_response(status, &headers, body)
}

/// The network failed: a concurrent request may have populated the cache meanwhile.
async fn network_fallback(state: &ProxyState, key: &str, err: anyhow::Error) -> Response {
    if let Some(hit) = state.cache.lookup(key).await {
        warn!("network failed for {}, served from cache: {:#}", key, err);
        return cached_response(hit);
    }
    error!("network failed for {} with no cached copy: {:#}", key, err);
    (StatusCode::BAD_GATEWAY, format!("error: {:#}", err)).into_response()
}

/// Pass a request through untouched and uncached. Bodies stream in both directions.
async fn forward(state: &ProxyState, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let url = state.upstream_url(&parts.uri);

    let mut upstream = state
        .client
        .request(parts.method.clone(), &url)
        .headers(forwardable_headers(&parts.headers));
    if has_body(&parts.headers) {
        upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }
    let sent = upstream.send().await;

    let resp = match sent {
        Ok(resp) => resp,
        Err(e) => {
            error!("forward {} {} failed: {}", parts.method, url, e);
            return (StatusCode::BAD_GATEWAY, format!("error: {}", e)).into_response();
        }
    };
    let status = resp.status();
    let headers = forwardable_headers(resp.headers());
    (status, headers, Body::from_stream(resp.bytes_stream())).into_response()
}

fn has_body(headers: &HeaderMap) -> bool {
    let declared_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    matches!(declared_len, Some(len) if len > 0) || headers.contains_key(header::TRANSFER_ENCODING)
}

fn upstream_response(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Response {
    (status, forwardable_headers(headers), Body::from(body)).into_response()
}

/// End-to-end headers of an upstream response, in the form kept beside a cached body.
fn replay_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    forwardable_headers(headers)
        .iter()
        .filter_map(|(name, value)| {
            let value = value.to_str().ok()?;
            Some((name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn cached_response(hit: CachedResponse) -> Response {
    let status = StatusCode::from_u16(hit.status).unwrap_or(StatusCode::OK);
    let mut headers = HeaderMap::new();
    for (name, value) in &hit.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => debug!("dropping unreplayable cached header {}", name),
        }
    }
    (status, headers, Body::from(hit.body)).into_response()
}
