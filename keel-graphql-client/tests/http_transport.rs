use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use keel_graphql_client::transport::{HttpTransport, ReqwestTransport};
use keel_graphql_client::{GraphQLClient, GraphQLClientConfig, GraphQLError, GraphQLRequest};

struct FlakyResponder {
    counter: Arc<AtomicUsize>,
}

impl Respond for FlakyResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let attempt = self.counter.fetch_add(1, Ordering::SeqCst);
        if attempt == 0 {
            ResponseTemplate::new(503).set_body_string("upstream unavailable")
        } else {
            ResponseTemplate::new(200).set_body_json(json!({"data": {"viewer": {"id": "user-2"}}}))
        }
    }
}

fn config_for(server: &MockServer) -> GraphQLClientConfig {
    GraphQLClientConfig::builder()
        .http_url(format!("{}/graphql", server.uri()))
        .bearer_auth("secret")
        .build()
}

#[tokio::test]
async fn test_posts_camel_case_json_with_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(header("authorization", "Bearer secret"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({
            "query": "query Viewer { viewer { id } }",
            "operationName": "Viewer",
            "variables": {"first": 1}
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": {"viewer": {"id": "user-1"}}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let transport = ReqwestTransport::new(&config_for(&server)).unwrap();
    let request = GraphQLRequest::new("query Viewer { viewer { id } }")
        .operation_name("Viewer")
        .variables(json!({"first": 1}));

    let response = transport.execute(&request).await.unwrap();
    assert_eq!(response.data, Some(json!({"viewer": {"id": "user-1"}})));
    assert!(!response.has_errors());
}

#[tokio::test]
async fn test_error_status_with_graphql_body_is_a_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "errors": [{
                "message": "Syntax Error: Unexpected Name \"quer\"",
                "locations": [{"line": 1, "column": 1}]
            }]
        })))
        .mount(&server)
        .await;

    let transport = ReqwestTransport::new(&config_for(&server)).unwrap();
    let response = transport.execute(&GraphQLRequest::new("quer { x }")).await.unwrap();

    let errors = response.errors.unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.starts_with("Syntax Error"));
}

#[tokio::test]
async fn test_error_status_without_graphql_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
        .mount(&server)
        .await;

    let transport = ReqwestTransport::new(&config_for(&server)).unwrap();
    let err = transport.execute(&GraphQLRequest::new("{ x }")).await.unwrap_err();

    match err {
        GraphQLError::HttpStatus { status, body } => {
            assert_eq!(status, 502);
            assert!(body.contains("bad gateway"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_undecodable_body_is_json_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let transport = ReqwestTransport::new(&config_for(&server)).unwrap();
    let err = transport.execute(&GraphQLRequest::new("{ x }")).await.unwrap_err();
    assert!(matches!(err, GraphQLError::Json(_)));
}

#[tokio::test]
async fn test_client_retries_server_errors() {
    let server = MockServer::start().await;
    let counter = Arc::new(AtomicUsize::new(0));
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(FlakyResponder {
            counter: counter.clone(),
        })
        .mount(&server)
        .await;

    let client = GraphQLClient::new(config_for(&server)).unwrap();
    let data = client.query("query Viewer { viewer { id } }").send_raw().await.unwrap();

    assert_eq!(data, json!({"viewer": {"id": "user-2"}}));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert!(client.connection_status().http);
}

#[tokio::test]
async fn test_client_timeout_is_enforced() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"data": {"slow": true}}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let client = GraphQLClient::new(config_for(&server)).unwrap();
    let err = client
        .query("query Slow { slow }")
        .timeout(Duration::from_millis(50))
        .retries(0)
        .send_raw()
        .await
        .unwrap_err();

    assert!(matches!(err, GraphQLError::Timeout(d) if d == Duration::from_millis(50)));
    assert!(!client.connection_status().http);

    // the health probe allows 5s, so the slow endpoint still counts as up
    assert!(client.check_health().await);
    assert!(client.connection_status().http);
}
