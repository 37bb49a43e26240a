//! `graphql-transport-ws` duplex transport over tokio-tungstenite.
//!
//! One socket carries every operation. A writer task drains an outgoing
//! channel into the sink; a reader task routes `next`/`error`/`complete`
//! frames to per-operation channels by id and answers pings.

use async_trait::async_trait;
use futures::Stream;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use self::protocol::{ClientMessage, ServerMessage, SubscribePayload};
use super::{DuplexConnection, DuplexTransport, OperationStream};
use crate::request::GraphQLRequest;
use crate::{GraphQLError, GraphQLResponse, GraphQLResponseError, Result};

/// Sub-protocol negotiated during the handshake.
pub const SUBPROTOCOL: &str = "graphql-transport-ws";

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type Route = mpsc::UnboundedSender<Result<GraphQLResponse<Value>>>;
type Routes = Arc<Mutex<HashMap<String, Route>>>;

enum Outgoing {
    Frame(ClientMessage),
    Close,
}

/// Connects to a `graphql-transport-ws` endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
    ack_timeout: Duration,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

impl WebSocketTransport {
    /// Create a transport with default timeouts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TCP/TLS/upgrade timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set how long to wait for `connection_ack`.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}

#[async_trait]
impl DuplexTransport for WebSocketTransport {
    async fn connect(
        &self,
        url: &str,
        connection_params: Option<Value>,
    ) -> Result<Arc<dyn DuplexConnection>> {
        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));

        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| GraphQLError::Timeout(self.connect_timeout))??;

        let (mut write, mut read) = ws_stream.split();

        let init = serde_json::to_string(&ClientMessage::ConnectionInit {
            payload: connection_params,
        })?;
        write.send(Message::Text(init.into())).await?;

        tokio::time::timeout(self.ack_timeout, wait_for_ack(&mut write, &mut read))
            .await
            .map_err(|_| {
                GraphQLError::Connection("timed out waiting for connection_ack".to_string())
            })??;

        info!(url, "GraphQL websocket connection established");
        Ok(Arc::new(WebSocketConnection::spawn(write, read)))
    }
}

async fn wait_for_ack(
    write: &mut SplitSink<WsStream, Message>,
    read: &mut SplitStream<WsStream>,
) -> Result<()> {
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text)? {
                ServerMessage::ConnectionAck { .. } => {
                    debug!("WebSocket connection acknowledged");
                    return Ok(());
                }
                ServerMessage::Ping { payload } => {
                    let pong = serde_json::to_string(&ClientMessage::Pong { payload })?;
                    write.send(Message::Text(pong.into())).await?;
                }
                other => {
                    return Err(GraphQLError::Connection(format!(
                        "expected connection_ack, got {:?}",
                        other
                    )));
                }
            },
            Some(Ok(Message::Close(frame))) => {
                return Err(GraphQLError::Connection(format!(
                    "connection closed before ack: {}",
                    close_reason(frame.as_ref())
                )));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(GraphQLError::Connection(
                    "connection closed before ack".to_string(),
                ));
            }
        }
    }
}

fn close_reason(frame: Option<&tokio_tungstenite::tungstenite::protocol::CloseFrame>) -> String {
    match frame {
        Some(frame) => format!("{} {}", u16::from(frame.code), frame.reason.as_str()),
        None => "no close frame".to_string(),
    }
}

/// A live, acknowledged socket.
struct WebSocketConnection {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    routes: Routes,
    open: Arc<AtomicBool>,
    next_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketConnection {
    fn spawn(write: SplitSink<WsStream, Message>, read: SplitStream<WsStream>) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let routes = Routes::default();
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(writer_task(write, outgoing_rx));
        let reader = tokio::spawn(reader_task(
            read,
            outgoing_tx.clone(),
            routes.clone(),
            open.clone(),
        ));

        Self {
            outgoing: outgoing_tx,
            routes,
            open,
            next_id: AtomicU64::new(1),
            reader: Mutex::new(Some(reader)),
        }
    }
}

impl DuplexConnection for WebSocketConnection {
    fn subscribe(&self, request: GraphQLRequest) -> Result<OperationStream> {
        if !self.is_open() {
            return Err(GraphQLError::Network("websocket connection is closed".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().insert(id.clone(), tx);

        let frame = ClientMessage::Subscribe {
            id: id.clone(),
            payload: SubscribePayload::from(request),
        };
        if self.outgoing.send(Outgoing::Frame(frame)).is_err() {
            self.routes.lock().remove(&id);
            return Err(GraphQLError::Network("websocket writer has stopped".to_string()));
        }

        debug!(id = %id, "Started websocket operation");
        Ok(Box::pin(OperationEvents {
            id,
            rx,
            outgoing: self.outgoing.clone(),
            routes: self.routes.clone(),
        }))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.outgoing.send(Outgoing::Close);
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        fail_routes(&self.routes, "closed by client");
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.close();
    }
}

fn fail_routes(routes: &Routes, reason: &str) {
    let drained: Vec<Route> = routes.lock().drain().map(|(_, route)| route).collect();
    for route in drained {
        let _ = route.send(Err(GraphQLError::Network(format!(
            "websocket connection lost: {}",
            reason
        ))));
    }
}

async fn writer_task(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(outgoing) = rx.recv().await {
        match outgoing {
            Outgoing::Frame(message) => {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode websocket frame");
                        continue;
                    }
                };
                if write.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Outgoing::Close => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        }
    }

    let _ = write.close().await;
}

async fn reader_task(
    mut read: SplitStream<WsStream>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    routes: Routes,
    open: Arc<AtomicBool>,
) {
    let reason = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::Next { id, payload }) => {
                    let route = routes.lock().get(&id).cloned();
                    if let Some(route) = route {
                        let response = serde_json::from_value(payload).map_err(GraphQLError::from);
                        let _ = route.send(response);
                    }
                }
                Ok(ServerMessage::Error { id, payload }) => {
                    let route = routes.lock().remove(&id);
                    if let Some(route) = route {
                        let errors: Vec<GraphQLResponseError> = payload
                            .into_iter()
                            .filter_map(|v| serde_json::from_value(v).ok())
                            .collect();
                        let _ = route.send(Err(GraphQLError::Validation(errors)));
                    }
                }
                Ok(ServerMessage::Complete { id }) => {
                    // dropping the sender ends the operation stream
                    routes.lock().remove(&id);
                }
                Ok(ServerMessage::Ping { payload }) => {
                    let _ = outgoing.send(Outgoing::Frame(ClientMessage::Pong { payload }));
                }
                Ok(ServerMessage::Pong { .. } | ServerMessage::ConnectionAck { .. }) => {}
                Err(e) => warn!(error = %e, "Ignoring undecodable websocket frame"),
            },
            Some(Ok(Message::Close(frame))) => break close_reason(frame.as_ref()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        }
    };

    open.store(false, Ordering::SeqCst);
    warn!(reason = %reason, "GraphQL websocket connection lost");
    fail_routes(&routes, &reason);
}

/// Receiving end of one operation. Dropping it sends `complete`.
struct OperationEvents {
    id: String,
    rx: mpsc::UnboundedReceiver<Result<GraphQLResponse<Value>>>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    routes: Routes,
}

impl Stream for OperationEvents {
    type Item = Result<GraphQLResponse<Value>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for OperationEvents {
    fn drop(&mut self) {
        let removed = self.routes.lock().remove(&self.id);
        if removed.is_some() {
            let _ = self.outgoing.send(Outgoing::Frame(ClientMessage::Complete {
                id: self.id.clone(),
            }));
        }
    }
}

/// graphql-transport-ws protocol messages.
pub mod protocol {
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    use crate::request::GraphQLRequest;

    /// Client to server message types.
    #[derive(Debug, Clone, Serialize)]
    #[serde(tag = "type")]
    pub enum ClientMessage {
        /// Initialize connection.
        #[serde(rename = "connection_init")]
        ConnectionInit {
            #[serde(skip_serializing_if = "Option::is_none")]
            payload: Option<Value>,
        },
        /// Start an operation.
        #[serde(rename = "subscribe")]
        Subscribe { id: String, payload: SubscribePayload },
        /// Stop an operation.
        #[serde(rename = "complete")]
        Complete { id: String },
        /// Ping for keep-alive.
        #[serde(rename = "ping")]
        Ping {
            #[serde(skip_serializing_if = "Option::is_none")]
            payload: Option<Value>,
        },
        /// Pong response.
        #[serde(rename = "pong")]
        Pong {
            #[serde(skip_serializing_if = "Option::is_none")]
            payload: Option<Value>,
        },
    }

    /// Subscribe payload.
    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SubscribePayload {
        pub query: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub operation_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub variables: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub extensions: Option<Value>,
    }

    impl From<GraphQLRequest> for SubscribePayload {
        fn from(request: GraphQLRequest) -> Self {
            Self {
                query: request.query,
                operation_name: request.operation_name,
                variables: request.variables,
                extensions: request.extensions,
            }
        }
    }

    /// Server to client message types.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(tag = "type")]
    pub enum ServerMessage {
        /// Connection acknowledged.
        #[serde(rename = "connection_ack")]
        ConnectionAck {
            #[serde(default)]
            payload: Option<Value>,
        },
        /// Operation result.
        #[serde(rename = "next")]
        Next { id: String, payload: Value },
        /// Operation failed; no further messages for this id.
        #[serde(rename = "error")]
        Error { id: String, payload: Vec<Value> },
        /// Operation finished.
        #[serde(rename = "complete")]
        Complete { id: String },
        /// Ping from server.
        #[serde(rename = "ping")]
        Ping {
            #[serde(default)]
            payload: Option<Value>,
        },
        /// Pong from server.
        #[serde(rename = "pong")]
        Pong {
            #[serde(default)]
            payload: Option<Value>,
        },
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        #[test]
        fn test_subscribe_frame_shape() {
            let request = GraphQLRequest::new("subscription OnPost { postAdded { id } }")
                .operation_name("OnPost")
                .variables(json!({"topic": "rust"}));
            let frame = ClientMessage::Subscribe {
                id: "1".into(),
                payload: request.into(),
            };

            assert_eq!(
                serde_json::to_value(&frame).unwrap(),
                json!({
                    "type": "subscribe",
                    "id": "1",
                    "payload": {
                        "query": "subscription OnPost { postAdded { id } }",
                        "operationName": "OnPost",
                        "variables": {"topic": "rust"}
                    }
                })
            );
        }

        #[test]
        fn test_server_frames_decode() {
            let next: ServerMessage = serde_json::from_value(
                json!({"type": "next", "id": "3", "payload": {"data": {"n": 1}}}),
            )
            .unwrap();
            assert!(matches!(next, ServerMessage::Next { ref id, .. } if id == "3"));

            let ack: ServerMessage =
                serde_json::from_value(json!({"type": "connection_ack"})).unwrap();
            assert!(matches!(ack, ServerMessage::ConnectionAck { payload: None }));

            let error: ServerMessage = serde_json::from_value(
                json!({"type": "error", "id": "3", "payload": [{"message": "bad"}]}),
            )
            .unwrap();
            assert!(matches!(
                error,
                ServerMessage::Error { ref payload, .. } if payload.len() == 1
            ));
        }
    }
}
