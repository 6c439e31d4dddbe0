// First-success racing over equivalent candidate sources.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, warn};

use super::traits::ArtifactSource;
use crate::error::{LoadError, SourceFailure};

/// Run `attempt` for every candidate concurrently and return the first success.
///
/// Candidate order carries no priority. Once a winner settles the remaining
/// attempts are dropped. Each attempt is bounded by `per_source_timeout` when
/// set; a timed-out attempt counts as a failed source. If every attempt fails
/// the error lists each failure in the order they settled.
pub async fn race_first_ok<T, F, Fut>(
    candidates: &[String],
    per_source_timeout: Option<Duration>,
    attempt: F,
) -> Result<T, LoadError>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if candidates.is_empty() {
        return Err(LoadError::invalid_input("no candidate sources"));
    }

    let mut pending: FuturesUnordered<_> = candidates
        .iter()
        .map(|url| {
            let fut = attempt(url.clone());
            async move {
                let out = match per_source_timeout {
                    Some(limit) => match tokio::time::timeout(limit, fut).await {
                        Ok(out) => out,
                        Err(_) => Err(anyhow!("timed out after {:?}", limit)),
                    },
                    None => fut.await,
                };
                (url, out)
            }
        })
        .collect();

    let mut failures = Vec::with_capacity(candidates.len());
    while let Some((url, out)) = pending.next().await {
        match out {
            Ok(value) => {
                debug!(url = url.as_str(), abandoned = pending.len(), "source won race");
                return Ok(value);
            }
            Err(e) => {
                debug!(url = url.as_str(), "source failed: {:#}", e);
                failures.push(SourceFailure {
                    url: url.clone(),
                    reason: format!("{:#}", e),
                });
            }
        }
    }

    warn!("all {} candidate sources failed", failures.len());
    Err(LoadError::AllSourcesFailed { failures })
}

/// Race `urls` through `source` for the artifact bytes. An empty body is a failure.
pub async fn race_bytes(
    source: &dyn ArtifactSource,
    urls: &[String],
    per_source_timeout: Option<Duration>,
) -> Result<Bytes, LoadError> {
    race_first_ok(urls, per_source_timeout, |url| async move {
        let bytes = source.fetch(&url).await?;
        if bytes.is_empty() {
            return Err(anyhow!("empty body: {}", url));
        }
        Ok(bytes)
    })
    .await
}
