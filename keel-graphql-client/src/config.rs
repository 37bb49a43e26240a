//! GraphQL client configuration.

use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::retry::Backoff;
use crate::{GraphQLError, Result};

/// Path of the GraphQL subscription endpoint on the duplex transport.
pub const SUBSCRIPTION_PATH: &str = "/graphql";

/// Response cache configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Whether queries are cached unless a call opts out.
    pub enabled: bool,
    /// Default time-to-live for cached results.
    pub ttl: Duration,
    /// Maximum number of cached results.
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            max_size: 100,
        }
    }
}

/// GraphQL client configuration.
#[derive(Debug, Clone)]
pub struct GraphQLClientConfig {
    /// GraphQL endpoint URL for queries and mutations.
    pub http_url: String,
    /// Duplex endpoint URL for subscriptions. Derived from `http_url` when unset.
    pub ws_url: Option<String>,
    /// Default per-request timeout.
    pub timeout: Duration,
    /// Retries after the initial attempt for queries and mutations.
    pub max_retries: u32,
    /// Reconnect budget for subscriptions.
    pub max_ws_retries: u32,
    /// Backoff between HTTP retries.
    pub retry_backoff: Backoff,
    /// Backoff between subscription reconnects.
    pub ws_retry_backoff: Backoff,
    /// Subscription errors closer together than this are not retried.
    pub min_retry_interval: Duration,
    /// Response cache settings.
    pub cache: CacheConfig,
    /// Payload sent with `connection_init` on the duplex transport.
    pub connection_params: Option<Value>,
    /// Default headers for all HTTP requests.
    pub default_headers: Vec<(String, String)>,
    /// User agent string.
    pub user_agent: String,
}

impl Default for GraphQLClientConfig {
    fn default() -> Self {
        Self {
            http_url: "http://localhost:4000/graphql".to_string(),
            ws_url: None,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            max_ws_retries: 5,
            retry_backoff: Backoff::default(),
            ws_retry_backoff: Backoff::exponential(
                Duration::from_secs(1),
                2.0,
                Duration::from_secs(30),
            ),
            min_retry_interval: Duration::from_secs(1),
            cache: CacheConfig::default(),
            connection_params: None,
            default_headers: Vec::new(),
            user_agent: format!("keel-graphql-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl GraphQLClientConfig {
    /// Create a new configuration builder.
    pub fn builder() -> GraphQLClientConfigBuilder {
        GraphQLClientConfigBuilder::default()
    }

    /// Create configuration for a specific endpoint.
    pub fn new(http_url: impl Into<String>) -> Self {
        Self {
            http_url: http_url.into(),
            ..Default::default()
        }
    }

    /// Resolve the duplex endpoint: the explicit `ws_url`, or `http_url` with
    /// its scheme swapped (`http→ws`, `https→wss`) and the subscription path.
    pub fn resolved_ws_url(&self) -> Result<String> {
        if let Some(ws_url) = &self.ws_url {
            return Ok(ws_url.clone());
        }

        let mut url = Url::parse(&self.http_url)
            .map_err(|e| GraphQLError::Config(format!("invalid http_url: {}", e)))?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(GraphQLError::Config(format!(
                    "cannot derive websocket url from scheme '{}'",
                    other
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| GraphQLError::Config("failed to set websocket scheme".to_string()))?;
        url.set_path(SUBSCRIPTION_PATH);
        url.set_query(None);
        Ok(url.to_string())
    }

    /// Check every option, returning the first problem found.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.http_url)
            .map_err(|e| GraphQLError::Config(format!("invalid http_url: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(GraphQLError::Config(format!(
                "http_url must use http or https, got '{}'",
                url.scheme()
            )));
        }

        let ws = self.resolved_ws_url()?;
        let ws =
            Url::parse(&ws).map_err(|e| GraphQLError::Config(format!("invalid ws_url: {}", e)))?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(GraphQLError::Config(format!(
                "ws_url must use ws or wss, got '{}'",
                ws.scheme()
            )));
        }

        if self.timeout.is_zero() {
            return Err(GraphQLError::Config("timeout must be non-zero".to_string()));
        }
        if self.cache.max_size == 0 {
            return Err(GraphQLError::Config("cache max_size must be at least 1".to_string()));
        }
        let backoffs = [
            ("retry", &self.retry_backoff),
            ("ws_retry", &self.ws_retry_backoff),
        ];
        for (name, backoff) in backoffs {
            if !(backoff.multiplier.is_finite() && backoff.multiplier >= 1.0) {
                return Err(GraphQLError::Config(format!(
                    "{} backoff multiplier must be >= 1.0",
                    name
                )));
            }
            if backoff.initial > backoff.max {
                return Err(GraphQLError::Config(format!(
                    "{} backoff initial delay exceeds its maximum",
                    name
                )));
            }
        }
        for (name, value) in &self.default_headers {
            http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| GraphQLError::Config(format!("invalid header name '{}'", name)))?;
            http::HeaderValue::from_str(value)
                .map_err(|_| GraphQLError::Config(format!("invalid value for header '{}'", name)))?;
        }
        Ok(())
    }
}

/// Builder for GraphQL client configuration.
#[derive(Debug, Default)]
pub struct GraphQLClientConfigBuilder {
    config: GraphQLClientConfig,
}

impl GraphQLClientConfigBuilder {
    /// Set the GraphQL endpoint URL.
    pub fn http_url(mut self, url: impl Into<String>) -> Self {
        self.config.http_url = url.into();
        self
    }

    /// Set the WebSocket endpoint for subscriptions.
    pub fn ws_url(mut self, url: impl Into<String>) -> Self {
        self.config.ws_url = Some(url.into());
        self
    }

    /// Set the default request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the retry budget for queries and mutations.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set the reconnect budget for subscriptions.
    pub fn max_ws_retries(mut self, retries: u32) -> Self {
        self.config.max_ws_retries = retries;
        self
    }

    /// Set the HTTP retry backoff.
    pub fn retry_backoff(mut self, backoff: Backoff) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    /// Set the subscription reconnect backoff.
    pub fn ws_retry_backoff(mut self, backoff: Backoff) -> Self {
        self.config.ws_retry_backoff = backoff;
        self
    }

    /// Set the minimum interval between subscription retries.
    pub fn min_retry_interval(mut self, interval: Duration) -> Self {
        self.config.min_retry_interval = interval;
        self
    }

    /// Enable or disable response caching by default.
    pub fn caching(mut self, enabled: bool) -> Self {
        self.config.cache.enabled = enabled;
        self
    }

    /// Set the default cache TTL.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache.ttl = ttl;
        self
    }

    /// Set the maximum number of cached results.
    pub fn cache_max_size(mut self, size: usize) -> Self {
        self.config.cache.max_size = size;
        self
    }

    /// Set the `connection_init` payload.
    pub fn connection_params(mut self, params: Value) -> Self {
        self.config.connection_params = Some(params);
        self
    }

    /// Add a default header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .default_headers
            .push((name.into(), value.into()));
        self
    }

    /// Set bearer authentication.
    pub fn bearer_auth(mut self, token: impl Into<String>) -> Self {
        self.config.default_headers.push((
            "Authorization".to_string(),
            format!("Bearer {}", token.into()),
        ));
        self
    }

    /// Set user agent string.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Build the configuration without validating it.
    pub fn build(self) -> GraphQLClientConfig {
        self.config
    }
}
