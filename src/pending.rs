//! In-flight requests awaiting a worker reply.
//!
//! An entry is removed exactly once: by [`PendingRequests::resolve`] when the
//! worker answers, or by its own timeout task. Both paths take the entry out
//! of the map under the same lock, so whichever runs second sees nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::{RelayError, Result};
use crate::protocol::BrokerToClient;
use crate::registry::ConnectionId;

/// Where the terminal reply for a request goes.
#[derive(Debug)]
pub enum ReplyTo {
    /// A client WebSocket connection, looked up in the client registry at
    /// delivery time.
    Connection(ConnectionId),
    /// A caller blocked on the synchronous HTTP endpoint.
    Waiter(oneshot::Sender<BrokerToClient>),
}

/// Everything needed to claim a slot in the table.
#[derive(Debug)]
pub struct PendingRequest {
    pub correlation_id: String,
    pub reply_to: ReplyTo,
    pub worker_id: ConnectionId,
    pub client_request_id: Option<String>,
    pub model: String,
    pub preview: String,
}

#[derive(Debug)]
pub struct PendingEntry {
    pub correlation_id: String,
    pub reply_to: ReplyTo,
    pub worker_id: ConnectionId,
    pub client_request_id: Option<String>,
    pub model: String,
    pub preview: String,
    pub created_at: Instant,
    pub deadline: Instant,
    timer: Option<AbortHandle>,
}

#[derive(Clone, Default)]
pub struct PendingRequests {
    entries: Arc<Mutex<HashMap<String, PendingEntry>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry and arm its deadline. `on_expire` runs only if the
    /// timer removes the entry before anything else resolves it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn claim<F>(&self, request: PendingRequest, timeout: Duration, on_expire: F) -> Result<()>
    where
        F: FnOnce(PendingEntry) + Send + 'static,
    {
        let mut entries = self.entries.lock();
        if entries.contains_key(&request.correlation_id) {
            return Err(RelayError::DuplicateRequest(request.correlation_id));
        }

        let created_at = Instant::now();
        let deadline = created_at + timeout;
        let table = self.clone();
        let key = request.correlation_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(entry) = table.take(&key) {
                tracing::debug!(
                    target = "clipboard_relay::pending",
                    correlation_id = %key,
                    "pending request expired"
                );
                on_expire(entry);
            }
        });

        entries.insert(
            request.correlation_id.clone(),
            PendingEntry {
                correlation_id: request.correlation_id,
                reply_to: request.reply_to,
                worker_id: request.worker_id,
                client_request_id: request.client_request_id,
                model: request.model,
                preview: request.preview,
                created_at,
                deadline,
                timer: Some(timer.abort_handle()),
            },
        );
        Ok(())
    }

    /// Remove the entry and disarm its timer. `None` if it already timed
    /// out, was resolved before, or never existed.
    pub fn resolve(&self, correlation_id: &str) -> Option<PendingEntry> {
        let mut entry = self.take(correlation_id)?;
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        Some(entry)
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.lock().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Correlation ids currently dispatched to `worker`.
    pub fn dispatched_to(&self, worker: &ConnectionId) -> Vec<String> {
        self.entries
            .lock()
            .values()
            .filter(|entry| &entry.worker_id == worker)
            .map(|entry| entry.correlation_id.clone())
            .collect()
    }

    fn take(&self, correlation_id: &str) -> Option<PendingEntry> {
        self.entries.lock().remove(correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn request(id: &str) -> PendingRequest {
        PendingRequest {
            correlation_id: id.to_string(),
            reply_to: ReplyTo::Connection(ConnectionId::new()),
            worker_id: ConnectionId::new(),
            client_request_id: None,
            model: "qwen-coder".into(),
            preview: "preview".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_claim_is_rejected() {
        let table = PendingRequests::new();
        table
            .claim(request("c1"), Duration::from_secs(60), |_| {})
            .unwrap();
        let err = table
            .claim(request("c1"), Duration::from_secs(60), |_| {})
            .unwrap_err();
        assert_eq!(err, RelayError::DuplicateRequest("c1".into()));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_resolve_observes_absent() {
        let table = PendingRequests::new();
        table
            .claim(request("c1"), Duration::from_secs(60), |_| {})
            .unwrap();
        assert!(table.resolve("c1").is_some());
        assert!(table.resolve("c1").is_none());
        assert!(table.resolve("never-claimed").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_and_removes_entry() {
        let table = PendingRequests::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        table
            .claim(request("c1"), Duration::from_secs(60), move |entry| {
                assert_eq!(entry.correlation_id, "c1");
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(table.contains("c1"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
        // A late reply finds nothing.
        assert!(table.resolve("c1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_disarms_timeout() {
        let table = PendingRequests::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        table
            .claim(request("c1"), Duration::from_secs(1), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(table.resolve("c1").is_some());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatched_to_filters_by_worker() {
        let table = PendingRequests::new();
        let worker = ConnectionId::new();
        let mut first = request("c1");
        first.worker_id = worker;
        table.claim(first, Duration::from_secs(60), |_| {}).unwrap();
        table
            .claim(request("c2"), Duration::from_secs(60), |_| {})
            .unwrap();
        assert_eq!(table.dispatched_to(&worker), vec!["c1".to_string()]);
    }
}
