//! End-to-end tunnel tests: a real server, real agents from the client
//! crate, and a real HTTP caller.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use culvert_client::{Client, ClientConfig, RequestHandler};
use culvert_common::{TunnelError, TunnelResult};
use culvert_server::{App, KeyValidator, ServerConfig, TunnelServer};
use culvert_wire::{hash_key_id, TunneledRequest, TunneledResponse};

fn test_server_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        timeout_ms: 1_000,
        id_header: Some("X-Target".to_string()),
        upstreams: vec!["127.0.0.1".to_string()],
        ..ServerConfig::default()
    }
}

async fn start_server(config: ServerConfig) -> (SocketAddr, TunnelServer) {
    let app = App::bind(config).await.unwrap();
    let addr = app.local_addr().unwrap();
    let server = app.server();
    tokio::spawn(app.run());
    (addr, server)
}

fn agent_config(addr: SocketAddr, id: &str, idle: usize, max: usize) -> ClientConfig {
    ClientConfig {
        id: id.to_string(),
        name: format!("test agent {id}"),
        targets: vec![format!("ws://{addr}/register")],
        pool_idle_size: idle,
        pool_max_size: max,
        ..ClientConfig::default()
    }
}

async fn wait_for_pool(server: &TunnelServer, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.pool_count() != count {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("agent never registered");
}

async fn wait_for_idle(server: &TunnelServer, pool: &str, idle: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(stats) = server.stats().await {
                if let Some(entry) = stats.pools.get(pool) {
                    if entry.sizes.idle >= idle {
                        return;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("pool never reached the expected idle count");
}

/// Answers `/ping` with `200 pong`, anything else with 404.
struct PongHandler;

#[async_trait]
impl RequestHandler for PongHandler {
    async fn handle(
        &self,
        request: TunneledRequest,
        _body: Bytes,
    ) -> TunnelResult<(TunneledResponse, Bytes)> {
        let mut header = std::collections::HashMap::new();
        header.insert(
            "X-Answered-By".to_string(),
            vec!["pong-handler".to_string()],
        );

        if request.url.contains("ping") {
            Ok((TunneledResponse::new(200, header, 4), Bytes::from_static(b"pong")))
        } else {
            Ok((TunneledResponse::new(404, header, 0), Bytes::new()))
        }
    }
}

/// Parks every request until released; used to hold sockets Busy.
struct SlowHandler {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl RequestHandler for SlowHandler {
    async fn handle(
        &self,
        _request: TunneledRequest,
        _body: Bytes,
    ) -> TunnelResult<(TunneledResponse, Bytes)> {
        self.started.notify_one();
        self.release.notified().await;
        Ok((
            TunneledResponse::new(200, std::collections::HashMap::new(), 4),
            Bytes::from_static(b"done"),
        ))
    }
}

/// Always fails, exercising the agent-error status path.
struct FailingHandler;

#[async_trait]
impl RequestHandler for FailingHandler {
    async fn handle(
        &self,
        _request: TunneledRequest,
        _body: Bytes,
    ) -> TunnelResult<(TunneledResponse, Bytes)> {
        Err(TunnelError::InvalidData("backend exploded".into()))
    }
}

#[tokio::test]
async fn known_target_round_trip() {
    let (addr, server) = start_server(test_server_config()).await;

    let mut config = agent_config(addr, "A", 2, 4);
    config.handler = Some(Arc::new(PongHandler));
    let mut agent = Client::new(config);
    agent.start();
    wait_for_pool(&server, 1).await;

    let caller = reqwest::Client::new();
    let response = caller
        .get(format!("http://{addr}/request/ping"))
        .header("X-Target", "A")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.headers()["x-answered-by"], "pong-handler");
    assert_eq!(response.text().await.unwrap(), "pong");

    // The socket went back to the pool, and the agent topped up to its
    // declared idle size.
    wait_for_idle(&server, "A", 2).await;

    // Exactly one exchange, against exactly one socket.
    let stats = server.stats().await.unwrap();
    let total_dispatches: u64 = stats.threads.values().sum();
    assert_eq!(total_dispatches, 1);
    let requests: u64 = stats.pools["A"].sizes.conns.iter().map(|c| c.requests).sum();
    assert_eq!(requests, 1);

    agent.shutdown();
}

#[tokio::test]
async fn unknown_target_gets_proxy_error() {
    let (addr, server) = start_server(test_server_config()).await;

    let mut config = agent_config(addr, "A", 1, 4);
    config.handler = Some(Arc::new(PongHandler));
    let mut agent = Client::new(config);
    agent.start();
    wait_for_pool(&server, 1).await;

    let caller = reqwest::Client::new();
    let response = caller
        .get(format!("http://{addr}/request/ping"))
        .header("X-Target", "B")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 526);
    let body = response.text().await.unwrap();
    assert!(
        body.contains("no proxy target found for request: B"),
        "unexpected body: {body}"
    );

    agent.shutdown();
}

#[tokio::test]
async fn missing_id_header_gets_proxy_error() {
    let (addr, server) = start_server(test_server_config()).await;

    let mut config = agent_config(addr, "A", 1, 4);
    config.handler = Some(Arc::new(PongHandler));
    let mut agent = Client::new(config);
    agent.start();
    wait_for_pool(&server, 1).await;

    let caller = reqwest::Client::new();
    let response = caller
        .get(format!("http://{addr}/request/ping"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 526);
    let body = response.text().await.unwrap();
    assert!(body.contains("required client id header is missing"));

    agent.shutdown();
}

#[tokio::test]
async fn no_agents_gets_no_pools_error() {
    let (addr, _server) = start_server(test_server_config()).await;

    let caller = reqwest::Client::new();
    let response = caller
        .get(format!("http://{addr}/request/ping"))
        .header("X-Target", "A")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 526);
    let body = response.text().await.unwrap();
    assert!(body.contains("no pools registered"), "unexpected body: {body}");
}

#[tokio::test]
async fn all_sockets_busy_times_out() {
    let mut server_config = test_server_config();
    server_config.timeout_ms = 100;
    let (addr, server) = start_server(server_config).await;

    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    // One socket, no replacements: max = 1.
    let mut config = agent_config(addr, "A", 1, 1);
    config.handler = Some(Arc::new(SlowHandler {
        started: Arc::clone(&started),
        release: Arc::clone(&release),
    }));
    let mut agent = Client::new(config);
    agent.start();
    wait_for_pool(&server, 1).await;

    let caller = reqwest::Client::new();
    let first = tokio::spawn({
        let caller = caller.clone();
        async move {
            caller
                .get(format!("http://{addr}/request/slow"))
                .header("X-Target", "A")
                .send()
                .await
                .unwrap()
        }
    });

    // Wait until the only socket is held mid-exchange.
    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("first request never reached the agent");

    let blocked_at = std::time::Instant::now();
    let second = caller
        .get(format!("http://{addr}/request/slow"))
        .header("X-Target", "A")
        .send()
        .await
        .unwrap();
    let elapsed = blocked_at.elapsed();

    assert_eq!(second.status().as_u16(), 526);
    let body = second.text().await.unwrap();
    assert!(
        body.contains("dispatch timed out after 100ms"),
        "unexpected body: {body}"
    );
    assert!(elapsed >= Duration::from_millis(90), "too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "too slow: {elapsed:?}");

    // Let the first exchange finish; the tunnel itself was never broken.
    release.notify_one();
    let first = first.await.unwrap();
    assert_eq!(first.status().as_u16(), 200);
    assert_eq!(first.text().await.unwrap(), "done");

    agent.shutdown();
}

#[tokio::test]
async fn agent_side_failure_surfaces_as_client_error() {
    let (addr, server) = start_server(test_server_config()).await;

    let mut config = agent_config(addr, "A", 1, 4);
    config.handler = Some(Arc::new(FailingHandler));
    let mut agent = Client::new(config);
    agent.start();
    wait_for_pool(&server, 1).await;

    let caller = reqwest::Client::new();
    let response = caller
        .get(format!("http://{addr}/request/ping"))
        .header("X-Target", "A")
        .send()
        .await
        .unwrap();

    // The agent answers 527 with the failure text; the server forwards it
    // verbatim.
    assert_eq!(response.status().as_u16(), 527);
    let body = response.text().await.unwrap();
    assert!(body.contains("backend exploded"), "unexpected body: {body}");

    agent.shutdown();
}

/// Validator that accepts anything and stamps a fixed secret, so pool keys
/// become hashes.
struct FixedSecretValidator;

#[async_trait]
impl KeyValidator for FixedSecretValidator {
    async fn validate(&self, _headers: &http::HeaderMap) -> TunnelResult<String> {
        Ok("s".to_string())
    }
}

#[tokio::test]
async fn validator_secret_hashes_the_pool_key() {
    let config = test_server_config();
    let app = App::bind_with_validator(config, Arc::new(FixedSecretValidator))
        .await
        .unwrap();
    let addr = app.local_addr().unwrap();
    let server = app.server();
    tokio::spawn(app.run());

    let mut config = agent_config(addr, "a", 1, 4);
    config.handler = Some(Arc::new(PongHandler));
    let mut agent = Client::new(config);
    agent.start();
    wait_for_pool(&server, 1).await;

    let hashed = hash_key_id("s", "a");
    let stats = server.stats().await.unwrap();
    assert!(
        stats.pools.contains_key(&hashed),
        "pool should be keyed by hex(sha256(secret || id))"
    );

    let caller = reqwest::Client::new();

    // The declared id is not a valid target.
    let response = caller
        .get(format!("http://{addr}/request/ping"))
        .header("X-Target", "a")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 526);

    // The hashed key is.
    let response = caller
        .get(format!("http://{addr}/request/ping"))
        .header("X-Target", &hashed)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    agent.shutdown();
}

#[tokio::test]
async fn destination_override_reaches_a_local_backend() {
    // A local backend the agent's built-in executor will call.
    let backend = axum::Router::new().route(
        "/ping",
        axum::routing::get(|| async { ([("X-Backend", "echo")], "pong") }),
    );
    let backend_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(backend_listener, backend).await.unwrap();
    });

    let (addr, server) = start_server(test_server_config()).await;

    // No custom handler: the agent executes over HTTP.
    let mut agent = Client::new(agent_config(addr, "A", 1, 4));
    agent.start();
    wait_for_pool(&server, 1).await;

    let caller = reqwest::Client::new();
    let response = caller
        .get(format!("http://{addr}/request/anything"))
        .header("X-Target", "A")
        .header("X-PROXY-DESTINATION", format!("http://{backend_addr}/ping"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.headers()["x-backend"], "echo");
    assert_eq!(response.text().await.unwrap(), "pong");

    agent.shutdown();
}

#[tokio::test]
async fn request_bodies_round_trip_to_the_backend() {
    let backend = axum::Router::new().route(
        "/echo",
        axum::routing::post(|body: Bytes| async move { body }),
    );
    let backend_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(backend_listener, backend).await.unwrap();
    });

    let (addr, server) = start_server(test_server_config()).await;
    let mut agent = Client::new(agent_config(addr, "A", 1, 4));
    agent.start();
    wait_for_pool(&server, 1).await;

    let payload = vec![7u8; 64 * 1024];
    let caller = reqwest::Client::new();
    let response = caller
        .post(format!("http://{addr}/request/echo"))
        .header("X-Target", "A")
        .header("X-PROXY-DESTINATION", format!("http://{backend_addr}/echo"))
        .body(payload.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let echoed = response.bytes().await.unwrap();
    assert_eq!(echoed.len(), payload.len());
    assert_eq!(&echoed[..], &payload[..]);

    agent.shutdown();
}

#[tokio::test]
async fn stats_and_metrics_endpoints_respond() {
    let (addr, server) = start_server(test_server_config()).await;

    let mut config = agent_config(addr, "A", 1, 4);
    config.handler = Some(Arc::new(PongHandler));
    let mut agent = Client::new(config);
    agent.start();
    wait_for_pool(&server, 1).await;

    let caller = reqwest::Client::new();

    let stats: serde_json::Value = caller
        .get(format!("http://{addr}/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(stats["pools"]["A"]["sizes"]["total"].as_u64().unwrap() >= 1);
    assert_eq!(stats["pools"]["A"]["client"]["id"], "A");

    let metrics = caller
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("culvert_registrations_total{result=\"success\"}"));

    agent.shutdown();
}

#[tokio::test]
async fn callers_outside_the_allowlist_are_rejected() {
    let mut config = test_server_config();
    config.upstreams = vec!["192.0.2.0/24".to_string()];
    let (addr, _server) = start_server(config).await;

    let caller = reqwest::Client::new();
    let response = caller
        .get(format!("http://{addr}/request/ping"))
        .header("X-Target", "A")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    let response = caller
        .get(format!("http://{addr}/stats"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn wrong_secret_key_is_rejected_at_register() {
    let mut config = test_server_config();
    config.secret_key = "server-secret".to_string();
    let (addr, server) = start_server(config).await;

    // Agent presents the wrong key; the pool never appears.
    let mut agent = Client::new(ClientConfig {
        secret_key: "wrong".to_string(),
        ..agent_config(addr, "A", 1, 4)
    });
    agent.start();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server.pool_count(), 0);
    agent.shutdown();

    // With the right key, registration goes through.
    let mut agent = Client::new(ClientConfig {
        secret_key: "server-secret".to_string(),
        ..agent_config(addr, "B", 1, 4)
    });
    agent.start();
    wait_for_pool(&server, 1).await;
    agent.shutdown();
}
