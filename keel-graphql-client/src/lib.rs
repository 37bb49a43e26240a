//! # Keel GraphQL Client
//!
//! A GraphQL client runtime: queries and mutations over HTTP, subscriptions
//! over one shared `graphql-transport-ws` connection, with caching,
//! deduplication and failure recovery handled for the caller.
//!
//! ## Features
//!
//! - **Response cache**: TTL-bounded, size-capped, pattern invalidation
//! - **Deduplication**: concurrent identical requests share one network call
//! - **Retries**: exponential backoff for timeouts and network failures
//! - **Optimistic mutations**: local cache patches with coarse rollback
//! - **Resilient subscriptions**: reconnect with backoff, bounded retries
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use keel_graphql_client::{GraphQLClient, GraphQLClientConfig};
//! use serde::Deserialize;
//! use serde_json::json;
//!
//! #[derive(Deserialize)]
//! struct User {
//!     id: String,
//!     name: String,
//! }
//!
//! #[derive(Deserialize)]
//! struct GetUserResponse {
//!     user: User,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GraphQLClientConfig::new("https://api.example.com/graphql");
//!     let client = GraphQLClient::new(config)?;
//!
//!     let response: GetUserResponse = client
//!         .query("query GetUser($id: ID!) { user(id: $id) { id name } }")
//!         .variables(json!({ "id": "123" }))
//!         .send()
//!         .await?;
//!
//!     println!("User: {}", response.user.name);
//!     Ok(())
//! }
//! ```
//!
//! ## Subscriptions
//!
//! ```rust,ignore
//! use keel_graphql_client::{GraphQLClient, GraphQLClientConfig, SubscriptionHandlers};
//! use serde_json::Value;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GraphQLClientConfig::new("https://api.example.com/graphql");
//!     let client = GraphQLClient::new(config)?;
//!
//!     let handle = client
//!         .subscribe("subscription { messageAdded { id content } }")
//!         .with_callback(SubscriptionHandlers::new(
//!             |message: Value| println!("Received: {}", message),
//!             |error| eprintln!("Error: {}", error),
//!         ))?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     handle.unsubscribe();
//!     client.dispose();
//!     Ok(())
//! }
//! ```

mod cache;
mod client;
mod config;
mod dedup;
mod error;
mod executor;
pub mod operation;
mod request;
mod response;
mod retry;
mod subscription;
pub mod transport;

pub use cache::{CacheStats, ResponseCache};
pub use client::{ConnectionStatus, GraphQLClient};
pub use config::{CacheConfig, GraphQLClientConfig, GraphQLClientConfigBuilder, SUBSCRIPTION_PATH};
pub use dedup::{PendingRequest, RequestDeduplicator};
pub use error::{GraphQLError, Result};
pub use executor::{ExecuteOptions, Executor, HEALTH_CHECK_TIMEOUT};
pub use operation::OperationKey;
pub use request::{CacheUpdate, GraphQLRequest, MutationBuilder, QueryBuilder, SubscriptionBuilder};
pub use response::{ErrorLocation, GraphQLResponse, GraphQLResponseError, PathSegment};
pub use retry::Backoff;
pub use subscription::{
    ConnectionState, SubscriptionHandle, SubscriptionHandlers, SubscriptionManager,
    SubscriptionPhase, SubscriptionStream,
};

// Re-export common types
pub use serde_json::Value as JsonValue;
