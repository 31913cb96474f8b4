//! End-to-end tests: a real proxy listener between a client, a mock token
//! endpoint and a mock upstream.

use std::collections::HashMap;
use std::net::SocketAddr;

use reqwest::header::HeaderValue;
use reqwest::{Client, StatusCode};
use tokio::sync::oneshot;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use tollgate_oauth::{AuthMode, ProxyServer, ServerConfig};

/// A proxy running in the background until dropped.
struct TestProxy {
    addr: SocketAddr,
    client: Client,
    _shutdown: oneshot::Sender<()>,
}

impl TestProxy {
    async fn start(config: ServerConfig) -> Self {
        let config = config.with_bind_address("127.0.0.1:0".parse().unwrap());
        let server = ProxyServer::new(&config).unwrap();

        let (tx, rx) = oneshot::channel::<()>();
        let addr = server
            .run_with_shutdown(async {
                let _ = rx.await;
            })
            .await
            .unwrap();

        Self {
            addr,
            client: Client::new(),
            _shutdown: tx,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

fn config(upstream: &MockServer, idp: &MockServer) -> ServerConfig {
    ServerConfig::new(&upstream.uri(), &format!("{}/token", idp.uri()), "svc")
        .unwrap()
        .with_client_secret("s3cret")
}

fn form(request: &Request) -> HashMap<String, String> {
    url::form_urlencoded::parse(&request.body)
        .into_owned()
        .collect()
}

async fn token_requests(idp: &MockServer) -> Vec<HashMap<String, String>> {
    idp.received_requests()
        .await
        .unwrap()
        .iter()
        .map(form)
        .collect()
}

fn token_response(token: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "access_token": token,
        "token_type": "Bearer",
        "expires_in": 3600
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Service token
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_no_subject_uses_cached_service_token() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .respond_with(token_response("service-token"))
        .expect(1)
        .mount(&idp)
        .await;

    Mock::given(method("GET"))
        .and(path("/status"))
        .and(header("authorization", "Bearer service-token"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(3)
        .mount(&upstream)
        .await;

    let proxy = TestProxy::start(config(&upstream, &idp)).await;

    for _ in 0..3 {
        let response = proxy.client.get(proxy.url("/status")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    let requests = token_requests(&idp).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["client_id"], "svc");
    assert_eq!(requests[0]["client_secret"], "s3cret");
}

#[tokio::test]
async fn test_scopes_are_space_joined() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(token_response("service-token"))
        .mount(&idp)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&upstream)
        .await;

    let proxy = TestProxy::start(config(&upstream, &idp).with_scope("read,write")).await;
    let response = proxy.client.get(proxy.url("/")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let requests = token_requests(&idp).await;
    assert_eq!(requests[0]["scope"], "read write");
}

// ─────────────────────────────────────────────────────────────────────────────
// Token exchange
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_subject_exchanged_with_client_credentials() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("subject=alice"))
        .respond_with(token_response("alice-token"))
        .expect(2)
        .mount(&idp)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/items"))
        .and(header("authorization", "Bearer alice-token"))
        .respond_with(ResponseTemplate::new(200).set_body_string("items"))
        .expect(2)
        .mount(&upstream)
        .await;

    let proxy = TestProxy::start(config(&upstream, &idp)).await;

    for _ in 0..2 {
        let response = proxy
            .client
            .get(proxy.url("/v1/items"))
            .header("x-subject", "alice")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Exchanged tokens are never cached.
    let requests = token_requests(&idp).await;
    assert_eq!(requests.len(), 2);
    for params in &requests {
        assert_eq!(
            params["grant_type"],
            "urn:ietf:params:oauth:grant-type:token-exchange"
        );
        assert_eq!(
            params["requested_token_type"],
            "urn:ietf:params:oauth:token-type:access_token"
        );
        assert_eq!(params["client_id"], "svc");
        assert_eq!(params["client_secret"], "s3cret");
        assert!(!params.contains_key("actor_token"));
    }
}

#[tokio::test]
async fn test_utf8_subject_is_percent_encoded() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("subject=zo%C3%AB"))
        .respond_with(token_response("zoe-token"))
        .expect(1)
        .mount(&idp)
        .await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer zoe-token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let proxy = TestProxy::start(config(&upstream, &idp)).await;

    let response = proxy
        .client
        .get(proxy.url("/profile"))
        .header("x-subject", HeaderValue::from_bytes("zoë".as_bytes()).unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let requests = token_requests(&idp).await;
    assert_eq!(requests[0]["subject"], "zoë");
}

#[tokio::test]
async fn test_actor_mode_presents_service_token() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .respond_with(token_response("service-token"))
        .expect(1)
        .mount(&idp)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("actor_token=service-token"))
        .respond_with(token_response("bob-token"))
        .expect(1)
        .mount(&idp)
        .await;

    Mock::given(method("GET"))
        .and(header("authorization", "Bearer bob-token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let proxy = TestProxy::start(
        config(&upstream, &idp)
            .with_auth_mode(AuthMode::ActorTokenExchange)
            .with_subject_field("user"),
    )
    .await;

    let response = proxy
        .client
        .get(proxy.url("/whoami"))
        .header("x-user", "bob")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let requests = token_requests(&idp).await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0]["grant_type"], "client_credentials");

    let exchange = &requests[1];
    assert_eq!(exchange["user"], "bob");
    assert_eq!(
        exchange["actor_token_type"],
        "urn:ietf:params:oauth:token-type:access_token"
    );
    assert!(!exchange.contains_key("client_id"));
    assert!(!exchange.contains_key("client_secret"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Failures
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_token_failure_never_reaches_upstream() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
        .mount(&idp)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let proxy = TestProxy::start(config(&upstream, &idp)).await;

    let plain = proxy.client.get(proxy.url("/")).send().await.unwrap();
    assert_eq!(plain.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(plain.text().await.unwrap().is_empty());

    let with_subject = proxy
        .client
        .get(proxy.url("/"))
        .header("x-subject", "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(with_subject.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let idp = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(token_response("service-token"))
        .mount(&idp)
        .await;

    let config = ServerConfig::new(
        "http://127.0.0.1:1",
        &format!("{}/token", idp.uri()),
        "svc",
    )
    .unwrap();
    let proxy = TestProxy::start(config).await;

    let response = proxy.client.get(proxy.url("/")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

// ─────────────────────────────────────────────────────────────────────────────
// Relaying
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_request_and_response_relayed_intact() {
    let idp = MockServer::start().await;
    let upstream = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(token_response("service-token"))
        .mount(&idp)
        .await;

    Mock::given(method("PUT"))
        .and(path("/api/v1/items/7"))
        .and(query_param("dry_run", "true"))
        .and(header("authorization", "Bearer service-token"))
        .and(header("x-request-id", "req-1"))
        .and(header("x-forwarded-for", "127.0.0.1"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("x-upstream", "seen")
                .set_body_string("accepted"),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let config = ServerConfig::new(
        &format!("{}/api", upstream.uri()),
        &format!("{}/token", idp.uri()),
        "svc",
    )
    .unwrap();
    let proxy = TestProxy::start(config).await;

    let response = proxy
        .client
        .put(proxy.url("/v1/items/7?dry_run=true"))
        .header("authorization", "Bearer from-caller")
        .header("x-request-id", "req-1")
        .body(r#"{"name":"widget"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()["x-upstream"], "seen");
    assert_eq!(response.text().await.unwrap(), "accepted");

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received[0].body, br#"{"name":"widget"}"#);
}
