//! Query/mutation execution: cache, dedup, timeout and retry.

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::ResponseCache;
use crate::dedup::RequestDeduplicator;
use crate::operation::{OperationKey, is_mutation};
use crate::request::GraphQLRequest;
use crate::retry::Backoff;
use crate::transport::HttpTransport;
use crate::{GraphQLClientConfig, GraphQLError, GraphQLResponse, Result};

/// Deadline used by [`Executor::check_health`].
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

const HEALTH_CHECK_QUERY: &str = "query { __typename }";

/// Per-call execution policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecuteOptions {
    /// Deadline for each attempt.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub retries: u32,
    /// Read and write the response cache. Ignored for mutations.
    pub cache: bool,
    /// Cache lifetime override.
    pub cache_ttl: Option<Duration>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self::from(&GraphQLClientConfig::default())
    }
}

impl From<&GraphQLClientConfig> for ExecuteOptions {
    fn from(config: &GraphQLClientConfig) -> Self {
        Self {
            timeout: config.timeout,
            retries: config.max_retries,
            cache: config.cache.enabled,
            cache_ttl: None,
        }
    }
}

/// Runs request/response operations over an [`HttpTransport`].
pub struct Executor {
    transport: Arc<dyn HttpTransport>,
    cache: Arc<ResponseCache>,
    dedup: RequestDeduplicator,
    backoff: Backoff,
    last_ok: Arc<AtomicBool>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("dedup", &self.dedup)
            .field("backoff", &self.backoff)
            .field("http_healthy", &self.http_healthy())
            .finish()
    }
}

impl Executor {
    /// Create an executor writing successful results into `cache`.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        cache: Arc<ResponseCache>,
        backoff: Backoff,
    ) -> Self {
        Self {
            transport,
            cache,
            dedup: RequestDeduplicator::new(),
            backoff,
            last_ok: Arc::new(AtomicBool::new(true)),
        }
    }

    /// The cache this executor reads and writes.
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// In-flight request table.
    pub fn deduplicator(&self) -> &RequestDeduplicator {
        &self.dedup
    }

    /// Whether the most recent transport exchange reached the server.
    pub fn http_healthy(&self) -> bool {
        self.last_ok.load(Ordering::SeqCst)
    }

    /// Execute one operation and return its `data`.
    ///
    /// A cached value is returned without I/O. A request already in flight
    /// for the same operation key is joined instead of sent again. The
    /// first caller's options govern a joined request.
    pub async fn execute(&self, request: GraphQLRequest, options: ExecuteOptions) -> Result<Value> {
        let key = OperationKey::new(&request.query, request.variables.as_ref());
        let cacheable = options.cache && !is_mutation(&request.query);

        if cacheable && let Some(data) = self.cache.get_by_key(&key) {
            debug!(key = %key, "Cache hit");
            return Ok(data);
        }

        let transport = Arc::clone(&self.transport);
        let last_ok = Arc::clone(&self.last_ok);
        let cache = Arc::clone(&self.cache);
        let backoff = self.backoff;
        let cache_key = key.clone();

        let work = async move {
            let data = send_with_retry(transport, last_ok, backoff, request, options).await?;
            if cacheable {
                cache.set_by_key(cache_key, data.clone(), options.cache_ttl);
            }
            Ok(data)
        };

        self.dedup.add_by_key(key, work).await
    }

    /// Probe the endpoint with `query { __typename }`.
    ///
    /// Bypasses the cache, never retries and reports failure as `false`.
    pub async fn check_health(&self) -> bool {
        let options = ExecuteOptions {
            timeout: HEALTH_CHECK_TIMEOUT,
            retries: 0,
            cache: false,
            cache_ttl: None,
        };

        match self.execute(GraphQLRequest::new(HEALTH_CHECK_QUERY), options).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Health check failed");
                false
            }
        }
    }
}

async fn send_with_retry(
    transport: Arc<dyn HttpTransport>,
    last_ok: Arc<AtomicBool>,
    backoff: Backoff,
    request: GraphQLRequest,
    options: ExecuteOptions,
) -> Result<Value> {
    let mut attempt = 0;

    loop {
        debug!(attempt = attempt + 1, "Sending GraphQL request");

        // Elapsing drops the transport future, which aborts the request.
        let attempted = tokio::time::timeout(options.timeout, transport.execute(&request)).await;
        let result = match attempted {
            Ok(result) => result,
            Err(_) => Err(GraphQLError::Timeout(options.timeout)),
        };

        match &result {
            Ok(_) => last_ok.store(true, Ordering::SeqCst),
            Err(e) if e.is_network_error() || e.is_timeout() => {
                last_ok.store(false, Ordering::SeqCst)
            }
            Err(_) => {}
        }

        let error = match result.and_then(GraphQLResponse::into_result) {
            Ok(data) => return Ok(data),
            Err(e) => e,
        };

        if !error.is_retryable() || attempt >= options.retries {
            return Err(error);
        }

        let delay = backoff.delay_for_attempt(attempt);
        warn!(
            attempt = attempt + 1,
            max_retries = options.retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "GraphQL request failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
