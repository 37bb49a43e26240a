use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

use keel_graphql_client::transport::{
    DuplexConnection, DuplexTransport, HttpTransport, OperationStream,
};
use keel_graphql_client::{
    Backoff, ConnectionStatus, GraphQLClient, GraphQLClientConfig, GraphQLError, GraphQLRequest,
    GraphQLResponse, GraphQLResponseError, Result, SubscriptionHandlers,
};

type Reply = Result<GraphQLResponse<Value>>;
type Responder = Box<dyn Fn(&GraphQLRequest, usize) -> Reply + Send + Sync>;

/// HTTP transport answering from a closure, counting calls.
struct ScriptedHttp {
    respond: Responder,
    delay: Duration,
    calls: AtomicUsize,
    seen: Mutex<Vec<GraphQLRequest>>,
}

impl ScriptedHttp {
    fn new(
        respond: impl Fn(&GraphQLRequest, usize) -> Reply + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::delayed(Duration::ZERO, respond)
    }

    fn delayed(
        delay: Duration,
        respond: impl Fn(&GraphQLRequest, usize) -> Reply + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            delay,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for ScriptedHttp {
    async fn execute(&self, request: &GraphQLRequest) -> Result<GraphQLResponse<Value>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.respond)(request, call)
    }
}

/// Duplex transport whose operation streams are fed by the test.
#[derive(Default)]
struct ScriptedDuplex {
    connects: AtomicUsize,
    feeds: Mutex<Vec<mpsc::UnboundedSender<Result<GraphQLResponse<Value>>>>>,
}

struct ScriptedConnection {
    open: std::sync::atomic::AtomicBool,
    owner: Arc<ScriptedDuplex>,
}

struct DuplexHandle(Arc<ScriptedDuplex>);

#[async_trait]
impl DuplexTransport for DuplexHandle {
    async fn connect(
        &self,
        _url: &str,
        _params: Option<Value>,
    ) -> Result<Arc<dyn DuplexConnection>> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedConnection {
            open: std::sync::atomic::AtomicBool::new(true),
            owner: Arc::clone(&self.0),
        }))
    }
}

impl DuplexConnection for ScriptedConnection {
    fn subscribe(&self, _request: GraphQLRequest) -> Result<OperationStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.owner.feeds.lock().push(tx);
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

fn config() -> GraphQLClientConfig {
    GraphQLClientConfig::builder()
        .http_url("http://localhost:4000/graphql")
        .cache_ttl(Duration::from_secs(60))
        .max_ws_retries(2)
        .ws_retry_backoff(Backoff::constant(Duration::from_secs(1)))
        .min_retry_interval(Duration::from_millis(100))
        .build()
}

fn client(http: Arc<ScriptedHttp>) -> GraphQLClient {
    client_with(http, Arc::new(ScriptedDuplex::default()))
}

fn client_with(http: Arc<ScriptedHttp>, duplex: Arc<ScriptedDuplex>) -> GraphQLClient {
    GraphQLClient::with_transports(config(), http, Arc::new(DuplexHandle(duplex))).unwrap()
}

fn data(value: Value) -> Result<GraphQLResponse<Value>> {
    Ok(GraphQLResponse::from_data(value))
}

const GET_USER: &str = "query GetUser($id: ID!) { user(id: $id) { id name } }";

#[derive(Debug, Deserialize, PartialEq)]
struct UserResponse {
    user: User,
}

#[derive(Debug, Deserialize, PartialEq)]
struct User {
    id: String,
    name: String,
}

#[tokio::test]
async fn test_concurrent_identical_queries_share_one_call() {
    let http = ScriptedHttp::delayed(Duration::from_millis(20), |_, _| {
        data(json!({"user": {"id": "1", "name": "Ada"}}))
    });
    let client = client(http.clone());

    let (a, b) = tokio::join!(
        client.query(GET_USER).variable("id", "1").send::<UserResponse>(),
        client.query(GET_USER).variable("id", "1").send::<UserResponse>(),
    );

    assert_eq!(assert_ok!(a), assert_ok!(b));
    assert_eq!(http.calls(), 1);
}

#[tokio::test]
async fn test_failed_dedup_request_fails_every_caller() {
    let http = ScriptedHttp::delayed(Duration::from_millis(20), |_, _| {
        Ok(GraphQLResponse::from_errors(vec![GraphQLResponseError::new("boom")]))
    });
    let client = client(http.clone());

    let (a, b) = tokio::join!(client.query(GET_USER).send_raw(), client.query(GET_USER).send_raw());

    assert!(assert_err!(a).is_graphql_error());
    assert!(assert_err!(b).is_graphql_error());
    assert_eq!(http.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cache_serves_until_ttl_expires() {
    let http = ScriptedHttp::new(|_, call| data(json!({"call": call})));
    let client = client(http.clone());

    let first = client.query(GET_USER).variable("id", "1").send_raw().await.unwrap();
    let cached = client.query(GET_USER).variable("id", "1").send_raw().await.unwrap();
    assert_eq!(first, cached);
    assert_eq!(http.calls(), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    let fresh = client.query(GET_USER).variable("id", "1").send_raw().await.unwrap();
    assert_eq!(fresh, json!({"call": 1}));
    assert_eq!(http.calls(), 2);
}

#[tokio::test]
async fn test_cache_key_is_sensitive_to_text_and_variables() {
    let http = ScriptedHttp::new(|_, call| data(json!({"call": call})));
    let client = client(http.clone());

    client.query(GET_USER).variables(json!({"id": "1", "x": 2})).send_raw().await.unwrap();
    // same variables in another order, extra whitespace: hit
    client
        .query("query GetUser($id: ID!) {\n  user(id: $id) { id name }\n}")
        .variables(json!({"x": 2, "id": "1"}))
        .send_raw()
        .await
        .unwrap();
    assert_eq!(http.calls(), 1);

    client.query(GET_USER).variables(json!({"id": "2", "x": 2})).send_raw().await.unwrap();
    client
        .query("query GetUser($id: ID!) { user(id: $id) { id } }")
        .variables(json!({"id": "1", "x": 2}))
        .send_raw()
        .await
        .unwrap();
    assert_eq!(http.calls(), 3);
}

#[tokio::test]
async fn test_per_call_cache_opt_out() {
    let http = ScriptedHttp::new(|_, call| data(json!(call)));
    let client = client(http.clone());

    client.query(GET_USER).send_raw().await.unwrap();
    client.query(GET_USER).cache(false).send_raw().await.unwrap();
    assert_eq!(http.calls(), 2);
}

#[tokio::test]
async fn test_mutations_are_never_cached() {
    let http = ScriptedHttp::new(|_, call| data(json!({"call": call})));
    let client = client(http.clone());
    let mutation = "mutation Rename($id: ID!) { rename(id: $id) }";

    client.mutation(mutation).variable("id", "1").send_raw().await.unwrap();
    client.mutation(mutation).variable("id", "1").send_raw().await.unwrap();
    client.query(mutation).variable("id", "1").send_raw().await.unwrap();

    assert_eq!(http.calls(), 3);
    assert_eq!(client.cache_stats().entries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_ceiling_with_growing_backoff() {
    let http = ScriptedHttp::new(|_, _| Err(GraphQLError::Network("connection refused".into())));
    let client = client(http.clone());

    let started = tokio::time::Instant::now();
    let err = client.query(GET_USER).retries(3).send_raw().await.unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(http.calls(), 4);
    // 100 + 200 + 400 ms
    assert_eq!(started.elapsed(), Duration::from_millis(700));
    assert_eq!(
        client.connection_status(),
        ConnectionStatus {
            http: false,
            websocket: false,
            retry_attempts: 0
        }
    );
}

#[tokio::test]
async fn test_validation_error_lists_every_message() {
    let http = ScriptedHttp::new(|_, _| {
        Ok(GraphQLResponse::from_errors(vec![
            GraphQLResponseError::new("first problem"),
            GraphQLResponseError::new("second problem"),
        ]))
    });
    let client = client(http.clone());

    let err = client.query(GET_USER).send_raw().await.unwrap_err();
    let message = err.to_string();

    assert!(message.contains("first problem"));
    assert!(message.contains("second problem"));
    assert_eq!(http.calls(), 1);
}

#[tokio::test]
async fn test_optimistic_mutation_rollback_invalidates_patterns() {
    let http = ScriptedHttp::new(|request, _| {
        if request.query.starts_with("mutation") {
            Err(GraphQLError::HttpStatus {
                status: 400,
                body: "rejected".into(),
            })
        } else {
            data(json!({"todos": ["a"]}))
        }
    });
    let client = client(http.clone());
    let todos = "query Todos { todos }";

    client.query(todos).send_raw().await.unwrap();
    let observed = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&observed);

    let err = client
        .mutation("mutation AddTodo { addTodo }")
        .optimistic_response(json!({"addTodo": "b"}))
        .update_cache(todos, None, move |mut cached, payload| {
            if let Some(list) = cached["todos"].as_array_mut() {
                list.push(payload["addTodo"].clone());
            }
            seen.lock().push(cached.clone());
            cached
        })
        .invalidate_on_error("^query Todos")
        .send_raw()
        .await
        .unwrap_err();

    assert!(matches!(err, GraphQLError::HttpStatus { status: 400, .. }));
    assert_eq!(*observed.lock(), vec![json!({"todos": ["a", "b"]})]);
    assert_eq!(client.cache_stats().entries, 0);

    client.query(todos).send_raw().await.unwrap();
    assert_eq!(http.calls(), 3);
}

#[tokio::test]
async fn test_successful_mutation_applies_updates_and_refetches() {
    let http = ScriptedHttp::new(|request, call| {
        if request.query.starts_with("mutation") {
            data(json!({"addTodo": "c"}))
        } else {
            data(json!({"todos": ["a"], "call": call}))
        }
    });
    let client = client(http.clone());
    let todos = "query Todos { todos }";
    let count = "query Count { count }";

    client.query(todos).send_raw().await.unwrap();

    client
        .mutation("mutation AddTodo { addTodo }")
        .update_cache(todos, None, |mut cached, payload| {
            cached["last"] = payload["addTodo"].clone();
            cached
        })
        .refetch(count, None)
        .await_refetch(true)
        .send_raw()
        .await
        .unwrap();

    assert_eq!(http.calls(), 3);
    let cached = client.query(todos).send_raw().await.unwrap();
    assert_eq!(cached["last"], json!("c"));
    // refetched result was written back
    client.query(count).send_raw().await.unwrap();
    assert_eq!(http.calls(), 3);
}

#[tokio::test]
async fn test_refetch_failure_does_not_fail_mutation() {
    let http = ScriptedHttp::new(|request, _| {
        if request.query.starts_with("mutation") {
            data(json!({"ok": true}))
        } else {
            Ok(GraphQLResponse::from_errors(vec![GraphQLResponseError::new("nope")]))
        }
    });
    let client = client(http.clone());

    let result = client
        .mutation("mutation Touch { touch }")
        .refetch("query Broken { broken }", None)
        .await_refetch(true)
        .send_raw()
        .await;

    assert_eq!(assert_ok!(result), json!({"ok": true}));
}

#[tokio::test]
async fn test_cache_management_surface() {
    let http = ScriptedHttp::new(|_, _| data(json!({"n": 1})));
    let client = client(http.clone());

    client.query("query A { n }").send_raw().await.unwrap();
    client.query("query B { n }").send_raw().await.unwrap();

    assert!(client.update_cache("query A { n }", None, |mut v| {
        v["n"] = json!(2);
        v
    }));
    assert!(!client.update_cache("query C { n }", None, |v| v));
    assert_eq!(client.query("query A { n }").send_raw().await.unwrap(), json!({"n": 2}));

    assert_eq!(client.invalidate_cache(Some("^query A")).unwrap(), 1);
    assert!(matches!(client.invalidate_cache(Some("(")), Err(GraphQLError::Config(_))));
    client.clear_cache();
    assert_eq!(client.cache_stats().entries, 0);
}

#[tokio::test]
async fn test_health_check_reports_instead_of_failing() {
    let healthy = client(ScriptedHttp::new(|_, _| data(json!({"__typename": "Query"}))));
    assert!(healthy.check_health().await);

    let down = ScriptedHttp::new(|_, _| Err(GraphQLError::Network("refused".into())));
    let unhealthy = client(down.clone());
    assert!(!unhealthy.check_health().await);
    assert_eq!(down.calls(), 1);
    assert_eq!(down.seen.lock()[0].query, "query { __typename }");
}

#[tokio::test(start_paused = true)]
async fn test_subscription_recovers_then_gives_up() {
    let duplex = Arc::new(ScriptedDuplex::default());
    let client = client_with(ScriptedHttp::new(|_, _| data(json!(null))), duplex.clone());
    let events = Arc::new(Mutex::new(Vec::<String>::new()));

    let on_data = Arc::clone(&events);
    let on_error = Arc::clone(&events);
    let handle = client
        .subscribe("subscription OnTick { tick }")
        .with_callback(SubscriptionHandlers::new(
            move |tick: u32| on_data.lock().push(format!("tick {}", tick)),
            move |e: GraphQLError| on_error.lock().push(format!("error {:?}", e.retry_count())),
        ))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(client.connection_status().websocket);

    let feed = duplex.feeds.lock().last().cloned().unwrap();
    feed.send(data(json!(1))).unwrap();
    feed.send(Err(GraphQLError::Network("reset".into()))).unwrap();

    // reconnect after 1s, then two more failures exhaust the budget of 2
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(2)).await;
        if let Some(feed) = duplex.feeds.lock().last() {
            let _ = feed.send(Err(GraphQLError::Network("reset".into())));
        }
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(!handle.is_active());
    assert_eq!(duplex.connects.load(Ordering::SeqCst), 3);
    assert_eq!(
        *events.lock(),
        vec!["tick 1".to_string(), "error Some(3)".to_string()]
    );
}

#[tokio::test]
async fn test_stream_subscription_and_dispose() {
    let duplex = Arc::new(ScriptedDuplex::default());
    let client = client_with(ScriptedHttp::new(|_, _| data(json!({"n": 1}))), duplex.clone());
    client.query("query N { n }").send_raw().await.unwrap();

    let mut stream = client.subscribe("subscription { n }").stream::<Value>().unwrap();
    tokio::task::yield_now().await;
    while duplex.feeds.lock().is_empty() {
        tokio::task::yield_now().await;
    }
    duplex.feeds.lock()[0].send(data(json!({"n": 5}))).unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), json!({"n": 5}));

    client.dispose();
    client.dispose();

    assert!(stream.next().await.is_none());
    assert_eq!(client.cache_stats().entries, 0);
    assert!(!client.connection_status().websocket);
    assert!(matches!(
        client.subscribe("subscription { n }").stream::<Value>(),
        Err(GraphQLError::Disposed)
    ));
}
