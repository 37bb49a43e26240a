//! GraphQL request builders.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::executor::ExecuteOptions;
use crate::subscription::{SubscriptionHandle, SubscriptionHandlers, SubscriptionStream};
use crate::{GraphQLClient, GraphQLError, Result};

/// GraphQL request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    /// The GraphQL query, mutation or subscription document.
    pub query: String,
    /// Operation name (for documents with multiple operations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    /// Variables for the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    /// Extensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLRequest {
    /// Create a new request.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            operation_name: None,
            variables: None,
            extensions: None,
        }
    }

    /// Set the operation name.
    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Set variables.
    pub fn variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Set extensions.
    pub fn extensions(mut self, extensions: Value) -> Self {
        self.extensions = Some(extensions);
        self
    }
}

/// Shared request-shaping state for the builders.
///
/// Variable serialization failures are kept and reported when the request
/// is sent.
#[derive(Debug)]
struct Draft {
    request: GraphQLRequest,
    error: Option<GraphQLError>,
}

impl Draft {
    fn new(query: String) -> Self {
        Self {
            request: GraphQLRequest::new(query),
            error: None,
        }
    }

    fn variables<T: Serialize>(&mut self, variables: T) {
        match serde_json::to_value(variables) {
            Ok(value) => self.request.variables = Some(value),
            Err(e) => self.error = Some(e.into()),
        }
    }

    fn variable(&mut self, name: String, value: impl Serialize) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                self.error = Some(e.into());
                return;
            }
        };
        let vars = self
            .request
            .variables
            .get_or_insert_with(|| Value::Object(Default::default()));
        match vars {
            Value::Object(map) => {
                map.insert(name, value);
            }
            _ => {
                self.error = Some(GraphQLError::Config(
                    "variables must be a JSON object to add a single variable".to_string(),
                ));
            }
        }
    }

    fn finish(self) -> Result<GraphQLRequest> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.request),
        }
    }
}

/// Query builder for GraphQL queries.
pub struct QueryBuilder<'a> {
    client: &'a GraphQLClient,
    draft: Draft,
    options: ExecuteOptions,
}

impl<'a> QueryBuilder<'a> {
    pub(crate) fn new(client: &'a GraphQLClient, query: impl Into<String>) -> Self {
        Self {
            client,
            draft: Draft::new(query.into()),
            options: client.default_options(),
        }
    }

    /// Set the operation name.
    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.draft.request.operation_name = Some(name.into());
        self
    }

    /// Set variables.
    pub fn variables<T: Serialize>(mut self, variables: T) -> Self {
        self.draft.variables(variables);
        self
    }

    /// Set a single variable.
    pub fn variable(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        self.draft.variable(name.into(), value);
        self
    }

    /// Set extensions.
    pub fn extensions(mut self, extensions: Value) -> Self {
        self.draft.request.extensions = Some(extensions);
        self
    }

    /// Per-attempt deadline for this query.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    /// Retries after the first attempt.
    pub fn retries(mut self, retries: u32) -> Self {
        self.options.retries = retries;
        self
    }

    /// Read and write the response cache.
    pub fn cache(mut self, enabled: bool) -> Self {
        self.options.cache = enabled;
        self
    }

    /// Cache lifetime of this result.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.options.cache_ttl = Some(ttl);
        self
    }

    /// Execute the query and return the raw `data` value.
    pub async fn send_raw(self) -> Result<Value> {
        let request = self.draft.finish()?;
        self.client.execute(request, self.options).await
    }

    /// Execute the query and deserialize the response.
    pub async fn send<T: DeserializeOwned>(self) -> Result<T> {
        let data = self.send_raw().await?;
        Ok(serde_json::from_value(data)?)
    }
}

/// Local cache patch applied around a mutation.
///
/// `apply` receives the cached value and the mutation payload (optimistic
/// or confirmed) and returns the new cached value.
#[derive(Clone)]
pub struct CacheUpdate {
    /// Query whose cache entry is patched.
    pub query: String,
    /// Variables of that query.
    pub variables: Option<Value>,
    /// Patch function.
    pub apply: Arc<dyn Fn(Value, &Value) -> Value + Send + Sync>,
}

impl fmt::Debug for CacheUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheUpdate")
            .field("query", &self.query)
            .field("variables", &self.variables)
            .finish_non_exhaustive()
    }
}

/// Everything a mutation needs once its builder is consumed.
#[derive(Debug)]
pub(crate) struct MutationPlan {
    pub(crate) request: GraphQLRequest,
    pub(crate) options: ExecuteOptions,
    pub(crate) optimistic_response: Option<Value>,
    pub(crate) cache_updates: Vec<CacheUpdate>,
    pub(crate) invalidate_on_error: Vec<String>,
    pub(crate) refetch: Vec<GraphQLRequest>,
    pub(crate) await_refetch: bool,
}

/// Mutation builder for GraphQL mutations.
///
/// Mutations are never cached. Cache updaters run with the confirmed
/// result on success; with an optimistic response they also run before the
/// request is sent, so they should be idempotent.
pub struct MutationBuilder<'a> {
    client: &'a GraphQLClient,
    draft: Draft,
    options: ExecuteOptions,
    optimistic_response: Option<Value>,
    cache_updates: Vec<CacheUpdate>,
    invalidate_on_error: Vec<String>,
    refetch: Vec<GraphQLRequest>,
    await_refetch: bool,
}

impl<'a> MutationBuilder<'a> {
    pub(crate) fn new(client: &'a GraphQLClient, mutation: impl Into<String>) -> Self {
        let mut options = client.default_options();
        options.cache = false;
        Self {
            client,
            draft: Draft::new(mutation.into()),
            options,
            optimistic_response: None,
            cache_updates: Vec::new(),
            invalidate_on_error: Vec::new(),
            refetch: Vec::new(),
            await_refetch: false,
        }
    }

    /// Set the operation name.
    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.draft.request.operation_name = Some(name.into());
        self
    }

    /// Set variables.
    pub fn variables<T: Serialize>(mut self, variables: T) -> Self {
        self.draft.variables(variables);
        self
    }

    /// Set a single variable.
    pub fn variable(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        self.draft.variable(name.into(), value);
        self
    }

    /// Per-attempt deadline for this mutation.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    /// Retries after the first attempt.
    pub fn retries(mut self, retries: u32) -> Self {
        self.options.retries = retries;
        self
    }

    /// Predicted result, written into the cache through the updaters before
    /// the server answers.
    pub fn optimistic_response<T: Serialize>(mut self, response: T) -> Self {
        match serde_json::to_value(response) {
            Ok(value) => self.optimistic_response = Some(value),
            Err(e) => self.draft.error = Some(e.into()),
        }
        self
    }

    /// Patch the cached result of `query` with the mutation payload.
    pub fn update_cache<F>(
        mut self,
        query: impl Into<String>,
        variables: Option<Value>,
        apply: F,
    ) -> Self
    where
        F: Fn(Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.cache_updates.push(CacheUpdate {
            query: query.into(),
            variables,
            apply: Arc::new(apply),
        });
        self
    }

    /// Cache key pattern dropped when an optimistic mutation fails.
    pub fn invalidate_on_error(mut self, pattern: impl Into<String>) -> Self {
        self.invalidate_on_error.push(pattern.into());
        self
    }

    /// Query re-executed after the mutation succeeds.
    pub fn refetch(mut self, query: impl Into<String>, variables: Option<Value>) -> Self {
        let mut request = GraphQLRequest::new(query);
        request.variables = variables;
        self.refetch.push(request);
        self
    }

    /// Wait for refetches before resolving. Off by default.
    pub fn await_refetch(mut self, wait: bool) -> Self {
        self.await_refetch = wait;
        self
    }

    /// Execute the mutation and return the raw `data` value.
    pub async fn send_raw(self) -> Result<Value> {
        let plan = MutationPlan {
            request: self.draft.finish()?,
            options: self.options,
            optimistic_response: self.optimistic_response,
            cache_updates: self.cache_updates,
            invalidate_on_error: self.invalidate_on_error,
            refetch: self.refetch,
            await_refetch: self.await_refetch,
        };
        self.client.execute_mutation(plan).await
    }

    /// Execute the mutation and deserialize the response.
    pub async fn send<T: DeserializeOwned>(self) -> Result<T> {
        let data = self.send_raw().await?;
        Ok(serde_json::from_value(data)?)
    }
}

/// Subscription builder for GraphQL subscriptions.
pub struct SubscriptionBuilder<'a> {
    client: &'a GraphQLClient,
    draft: Draft,
}

impl<'a> SubscriptionBuilder<'a> {
    pub(crate) fn new(client: &'a GraphQLClient, subscription: impl Into<String>) -> Self {
        Self {
            client,
            draft: Draft::new(subscription.into()),
        }
    }

    /// Set the operation name.
    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.draft.request.operation_name = Some(name.into());
        self
    }

    /// Set variables.
    pub fn variables<T: Serialize>(mut self, variables: T) -> Self {
        self.draft.variables(variables);
        self
    }

    /// Set a single variable.
    pub fn variable(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        self.draft.variable(name.into(), value);
        self
    }

    /// Wait for the first message. The operation stays open until the
    /// returned handle unsubscribes.
    pub async fn first<T: DeserializeOwned>(self) -> Result<(T, SubscriptionHandle)> {
        let request = self.draft.finish()?;
        self.client.subscriptions().subscribe(request).await
    }

    /// Stream every message. Dropping the stream unsubscribes.
    pub fn stream<T: DeserializeOwned>(self) -> Result<SubscriptionStream<T>> {
        let request = self.draft.finish()?;
        self.client.subscriptions().subscribe_stream(request)
    }

    /// Deliver messages to `handlers` until cancelled, completed or out of
    /// retries.
    pub fn with_callback<T: DeserializeOwned + 'static>(
        self,
        handlers: SubscriptionHandlers<T>,
    ) -> Result<SubscriptionHandle> {
        let request = self.draft.finish()?;
        self.client
            .subscriptions()
            .subscribe_with_callback(request, handlers)
    }
}
