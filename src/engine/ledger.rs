// In-flight request ledger: one acquisition per key, shared by every concurrent caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::LoadError;

type Ticket = Shared<BoxFuture<'static, Result<Bytes, LoadError>>>;
type TicketMap = Arc<Mutex<HashMap<String, Ticket>>>;

#[derive(Default)]
pub struct InFlightLedger {
    tickets: TicketMap,
}

/// Removes the ticket when the producer task finishes, however it finishes.
struct TicketGuard {
    tickets: TicketMap,
    key: String,
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        self.tickets.lock().remove(&self.key);
    }
}

impl InFlightLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Await the pending acquisition for `key`, or start one with `producer`.
    ///
    /// `producer` is invoked at most once per pending ticket; callers that join
    /// while it runs observe the same success or the same error. The producer
    /// runs on its own task, so it completes even if every caller goes away,
    /// and the ticket is gone before its result is published.
    ///
    /// `producer` is called with the ledger lock held and must not touch the ledger.
    pub async fn acquire<F, Fut>(&self, key: &str, producer: F) -> Result<Bytes, LoadError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, LoadError>> + Send + 'static,
    {
        let ticket = {
            let mut tickets = self.tickets.lock();
            if let Some(ticket) = tickets.get(key) {
                debug!(key, "joining in-flight acquisition");
                ticket.clone()
            } else {
                let guard = TicketGuard {
                    tickets: Arc::clone(&self.tickets),
                    key: key.to_string(),
                };
                let work = producer();
                let task = tokio::spawn(async move {
                    let out = work.await;
                    drop(guard);
                    out
                });

                let owned_key = key.to_string();
                let ticket = async move {
                    match task.await {
                        Ok(out) => out,
                        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Err(_) => Err(LoadError::Aborted { key: owned_key }),
                    }
                }
                .boxed()
                .shared();

                tickets.insert(key.to_string(), ticket.clone());
                ticket
            }
        };

        ticket.await
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.tickets.lock().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.tickets.lock().len()
    }
}
