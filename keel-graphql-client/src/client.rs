//! GraphQL client implementation.

use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, ResponseCache};
use crate::executor::{ExecuteOptions, Executor};
use crate::request::{GraphQLRequest, MutationPlan};
use crate::subscription::SubscriptionManager;
use crate::transport::{DuplexTransport, HttpTransport, ReqwestTransport, WebSocketTransport};
use crate::{GraphQLClientConfig, MutationBuilder, QueryBuilder, Result, SubscriptionBuilder};

/// Reachability of both transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// The last HTTP exchange reached the server.
    pub http: bool,
    /// The shared websocket is open.
    pub websocket: bool,
    /// Reconnect attempts since the websocket last connected.
    pub retry_attempts: u32,
}

struct ClientInner {
    config: GraphQLClientConfig,
    executor: Executor,
    subscriptions: SubscriptionManager,
    disposed: AtomicBool,
}

/// GraphQL client.
///
/// Cheap to clone; clones share the cache, in-flight requests and the
/// subscription connection.
#[derive(Clone)]
pub struct GraphQLClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for GraphQLClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphQLClient")
            .field("http_url", &self.inner.config.http_url)
            .field("executor", &self.inner.executor)
            .field("subscriptions", &self.inner.subscriptions)
            .finish()
    }
}

impl GraphQLClient {
    /// Create a client with the reqwest and websocket transports.
    pub fn new(config: GraphQLClientConfig) -> Result<Self> {
        config.validate()?;
        let http = Arc::new(ReqwestTransport::new(&config)?);
        Self::with_transports(config, http, Arc::new(WebSocketTransport::new()))
    }

    /// Create a client over caller-supplied transports.
    pub fn with_transports(
        config: GraphQLClientConfig,
        http: Arc<dyn HttpTransport>,
        duplex: Arc<dyn DuplexTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let ws_url = config.resolved_ws_url()?;

        let cache = Arc::new(ResponseCache::new(&config.cache));
        let executor = Executor::new(http, cache, config.retry_backoff);
        let subscriptions = SubscriptionManager::new(duplex, ws_url, &config);

        debug!(http_url = %config.http_url, "GraphQL client created");
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                executor,
                subscriptions,
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &GraphQLClientConfig {
        &self.inner.config
    }

    /// Create a query builder.
    pub fn query(&self, query: impl Into<String>) -> QueryBuilder<'_> {
        QueryBuilder::new(self, query)
    }

    /// Create a mutation builder.
    pub fn mutation(&self, mutation: impl Into<String>) -> MutationBuilder<'_> {
        MutationBuilder::new(self, mutation)
    }

    /// Create a subscription builder.
    pub fn subscribe(&self, subscription: impl Into<String>) -> SubscriptionBuilder<'_> {
        SubscriptionBuilder::new(self, subscription)
    }

    /// Drop cached results whose operation key matches `pattern`, or all of
    /// them. Returns the number removed.
    pub fn invalidate_cache(&self, pattern: Option<&str>) -> Result<usize> {
        self.inner.executor.cache().invalidate(pattern)
    }

    /// Patch a cached result in place. Returns `false` when nothing is cached.
    pub fn update_cache<F>(&self, query: &str, variables: Option<&Value>, updater: F) -> bool
    where
        F: FnOnce(Value) -> Value,
    {
        self.inner.executor.cache().update(query, variables, updater)
    }

    /// Drop every cached result.
    pub fn clear_cache(&self) {
        self.inner.executor.cache().clear();
    }

    /// Cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.executor.cache().stats()
    }

    /// Probe the HTTP endpoint. Never errors.
    pub async fn check_health(&self) -> bool {
        self.inner.executor.check_health().await
    }

    /// Reachability of both transports.
    pub fn connection_status(&self) -> ConnectionStatus {
        let (websocket, retry_attempts) = self.inner.subscriptions.connection_status();
        ConnectionStatus {
            http: self.inner.executor.http_healthy(),
            websocket,
            retry_attempts,
        }
    }

    /// Cancel every subscription, close the websocket and clear the cache.
    ///
    /// Safe to call more than once. Queries and mutations keep working;
    /// new subscriptions fail with [`crate::GraphQLError::Disposed`].
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.subscriptions.dispose();
        self.inner.executor.cache().clear();
        info!("GraphQL client disposed");
    }

    /// The subscription manager behind [`GraphQLClient::subscribe`].
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.inner.subscriptions
    }

    pub(crate) fn default_options(&self) -> ExecuteOptions {
        ExecuteOptions::from(&self.inner.config)
    }

    pub(crate) async fn execute(
        &self,
        request: GraphQLRequest,
        options: ExecuteOptions,
    ) -> Result<Value> {
        self.inner.executor.execute(request, options).await
    }

    pub(crate) async fn execute_mutation(&self, plan: MutationPlan) -> Result<Value> {
        let MutationPlan {
            request,
            options,
            optimistic_response,
            cache_updates,
            invalidate_on_error,
            refetch,
            await_refetch,
        } = plan;
        let cache = self.inner.executor.cache();

        if let Some(optimistic) = &optimistic_response {
            for update in &cache_updates {
                cache.update(&update.query, update.variables.as_ref(), |cached| {
                    (update.apply)(cached, optimistic)
                });
            }
        }

        let data = match self.execute(request, options).await {
            Ok(data) => data,
            Err(e) => {
                if optimistic_response.is_some() {
                    for pattern in &invalidate_on_error {
                        match cache.invalidate(Some(pattern)) {
                            Ok(removed) => {
                                debug!(pattern = %pattern, removed, "Rolled back optimistic update")
                            }
                            Err(invalid) => {
                                warn!(
                                    pattern = %pattern,
                                    error = %invalid,
                                    "Invalid rollback pattern"
                                )
                            }
                        }
                    }
                }
                return Err(e);
            }
        };

        for update in &cache_updates {
            cache.update(&update.query, update.variables.as_ref(), |cached| {
                (update.apply)(cached, &data)
            });
        }

        if !refetch.is_empty() {
            let refetching = refetch_all(Arc::clone(&self.inner), refetch);
            if await_refetch {
                refetching.await;
            } else {
                tokio::spawn(refetching);
            }
        }

        Ok(data)
    }
}

/// Re-run queries in parallel, bypassing cache reads and writing results back.
async fn refetch_all(inner: Arc<ClientInner>, queries: Vec<GraphQLRequest>) {
    let options = ExecuteOptions {
        timeout: inner.config.timeout,
        retries: inner.config.max_retries,
        cache: false,
        cache_ttl: None,
    };

    let results = join_all(queries.into_iter().map(|request| {
        let inner = Arc::clone(&inner);
        async move {
            let result = inner.executor.execute(request.clone(), options).await;
            (request, result)
        }
    }))
    .await;

    for (request, result) in results {
        match result {
            Ok(data) if inner.config.cache.enabled => {
                inner
                    .executor
                    .cache()
                    .set(&request.query, request.variables.as_ref(), data, None);
            }
            Ok(_) => {}
            Err(e) => warn!(query = %request.query, error = %e, "Refetch failed"),
        }
    }
}
