//! Transport seams.
//!
//! The executor and subscription manager never speak a wire protocol
//! directly. They drive an [`HttpTransport`] for request/response operations
//! and a [`DuplexTransport`] for subscriptions. [`ReqwestTransport`] and
//! [`WebSocketTransport`] are the default implementations; tests and
//! embedders can supply their own.

mod http;
mod websocket;

pub use self::http::ReqwestTransport;
pub use self::websocket::{WebSocketTransport, protocol};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::sync::Arc;

use crate::request::GraphQLRequest;
use crate::{GraphQLResponse, Result};

/// Single request, single result.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send one operation and return the decoded `{ data?, errors? }` payload.
    ///
    /// Dropping the returned future must abort the request.
    async fn execute(&self, request: &GraphQLRequest) -> Result<GraphQLResponse<Value>>;
}

/// Events of one operation on a duplex connection.
///
/// Each item is a `next` payload or a failure. The stream ending without an
/// error means the server completed the operation. Dropping the stream
/// unsubscribes.
pub type OperationStream = BoxStream<'static, Result<GraphQLResponse<Value>>>;

/// Factory for persistent duplex connections.
#[async_trait]
pub trait DuplexTransport: Send + Sync {
    /// Open a connection and complete its handshake, sending
    /// `connection_params` as the init payload.
    async fn connect(
        &self,
        url: &str,
        connection_params: Option<Value>,
    ) -> Result<Arc<dyn DuplexConnection>>;
}

/// A live duplex connection multiplexing operations.
pub trait DuplexConnection: Send + Sync {
    /// Start an operation on this connection.
    fn subscribe(&self, request: GraphQLRequest) -> Result<OperationStream>;

    /// Whether the connection can still carry operations.
    fn is_open(&self) -> bool;

    /// Tear the connection down. Open operation streams fail.
    fn close(&self);
}
