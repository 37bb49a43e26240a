//! GraphQL client error types.

use std::time::Duration;
use thiserror::Error;

use crate::GraphQLResponseError;

/// Result type for GraphQL client operations.
pub type Result<T> = std::result::Result<T, GraphQLError>;

/// GraphQL client errors.
///
/// Errors are `Clone` because a single in-flight request may be shared by
/// several deduplicated callers, each of which receives its own copy of the
/// failure.
#[derive(Debug, Clone, Error)]
pub enum GraphQLError {
    /// The operation exceeded its deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level failure (connection refused, reset, lost socket).
    #[error("Network error: {0}")]
    Network(String),

    /// The endpoint answered with a non-success HTTP status.
    #[error("HTTP status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The server answered with a GraphQL `errors` array.
    #[error("GraphQL validation failed: {}", join_messages(.0))]
    Validation(Vec<GraphQLResponseError>),

    /// Duplex transport failure for a subscription.
    #[error("Subscription error after {retry_count} retries: {message}")]
    Subscription {
        /// Failure description.
        message: String,
        /// Retry count of the subscription when the error was raised.
        retry_count: u32,
    },

    /// Fatal failure while establishing the duplex connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// Invalid configuration or argument.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The server returned neither data nor errors.
    #[error("Response contained no data")]
    EmptyResponse,

    /// The client (or its subscription manager) has been disposed.
    #[error("Client has been disposed")]
    Disposed,
}

fn join_messages(errors: &[GraphQLResponseError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl GraphQLError {
    /// Check if this error should be retried by the executor.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            // 5xx, request timeout and rate limiting are transient
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// Check if this is a network error.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            Self::Network(_)
                | Self::HttpStatus { .. }
                | Self::Connection(_)
                | Self::Subscription { .. }
        )
    }

    /// Check if this is a GraphQL error (server-side).
    pub fn is_graphql_error(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Get GraphQL errors if this is a validation error.
    pub fn graphql_errors(&self) -> Option<&[GraphQLResponseError]> {
        match self {
            Self::Validation(errors) => Some(errors),
            _ => None,
        }
    }

    /// Retry count carried by a subscription error.
    pub fn retry_count(&self) -> Option<u32> {
        match self {
            Self::Subscription { retry_count, .. } => Some(*retry_count),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for GraphQLError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<reqwest::Error> for GraphQLError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not expose the configured deadline on the error
            Self::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            Self::Json(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GraphQLError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(err.to_string())
    }
}
