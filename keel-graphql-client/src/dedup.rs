//! In-flight request deduplication.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::operation::OperationKey;
use crate::{GraphQLError, Result};

/// Handle to an in-flight request. Every clone resolves to the same result.
pub type PendingRequest = Shared<BoxFuture<'static, Result<Value>>>;

type PendingTable = HashMap<OperationKey, (u64, PendingRequest)>;

/// Tracks in-flight requests so concurrent identical calls share one execution.
#[derive(Default)]
pub struct RequestDeduplicator {
    pending: Arc<Mutex<PendingTable>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for RequestDeduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDeduplicator")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl RequestDeduplicator {
    /// Create an empty deduplicator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a request for this operation is in flight.
    pub fn has_pending_request(&self, operation: &str, variables: Option<&Value>) -> bool {
        self.pending
            .lock()
            .contains_key(&OperationKey::new(operation, variables))
    }

    /// Get the in-flight request for this operation, if any.
    pub fn get_pending_request(
        &self,
        operation: &str,
        variables: Option<&Value>,
    ) -> Option<PendingRequest> {
        self.get_by_key(&OperationKey::new(operation, variables))
    }

    pub(crate) fn get_by_key(&self, key: &OperationKey) -> Option<PendingRequest> {
        self.pending.lock().get(key).map(|(_, request)| request.clone())
    }

    /// Register `future` as the in-flight request for this operation.
    ///
    /// The work runs on its own task and its table entry is removed once it
    /// settles, whether it succeeded or failed, even if every caller has
    /// stopped waiting. If another request for the same key is already in
    /// flight, that request is returned and `future` is dropped unpolled.
    pub fn add_pending_request<F>(
        &self,
        operation: &str,
        variables: Option<&Value>,
        future: F,
    ) -> PendingRequest
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        self.add_by_key(OperationKey::new(operation, variables), future)
    }

    pub(crate) fn add_by_key<F>(&self, key: OperationKey, future: F) -> PendingRequest
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        let mut table = self.pending.lock();
        if let Some((_, existing)) = table.get(&key) {
            debug!(key = %key, "Joining in-flight request");
            return existing.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        let cleanup_key = key.clone();

        // The table lock is held until the entry is inserted, so the cleanup
        // below can never run before the registration it removes.
        let task = tokio::spawn(async move {
            let result = future.await;
            let mut table = pending.lock();
            if table
                .get(&cleanup_key)
                .is_some_and(|(entry_id, _)| *entry_id == id)
            {
                table.remove(&cleanup_key);
            }
            result
        });

        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(GraphQLError::Network(format!("request task failed: {}", e))),
            }
        }
        .boxed()
        .shared();

        table.insert(key, (id, shared.clone()));
        shared
    }

    /// Number of requests currently in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
