//! HTTP entry points: agent registration, request proxying, stats, metrics.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocket;
use axum::extract::{ConnectInfo, Request, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use url::Url;

use culvert_common::{TunnelError, TunnelResult};
use culvert_wire::{
    Handshake, PoolKey, TunneledRequest, DESTINATION_HEADER, HANDSHAKE_TIMEOUT, PROXY_ERROR_CODE,
};

use crate::allowlist::AllowedNets;
use crate::config::{KeyValidator, ServerConfig};
use crate::dispatch::{PoolRegistration, TunnelServer};
use crate::exchange::proxy_exchange;
use crate::metrics::{self, Metrics};
use crate::socket::TunnelSocket;
use crate::transport::{Frame, FrameTransport};

/// Shared handler state. Cheap to clone.
#[derive(Clone)]
pub struct AppState(Arc<AppStateInner>);

struct AppStateInner {
    config: Arc<ServerConfig>,
    server: TunnelServer,
    metrics: Arc<Metrics>,
    allow: AllowedNets,
    validator: Arc<dyn KeyValidator>,
}

impl AppState {
    pub fn new(
        config: Arc<ServerConfig>,
        server: TunnelServer,
        metrics: Arc<Metrics>,
        validator: Arc<dyn KeyValidator>,
    ) -> Self {
        let allow = AllowedNets::parse(&config.upstreams);
        Self(Arc::new(AppStateInner {
            config,
            server,
            metrics,
            allow,
            validator,
        }))
    }

    fn config(&self) -> &ServerConfig {
        &self.0.config
    }

    fn server(&self) -> &TunnelServer {
        &self.0.server
    }

    fn metrics(&self) -> &Metrics {
        &self.0.metrics
    }
}

/// Build the server's router. The register endpoint is open to the world;
/// everything callers touch sits behind the IP allow-list.
pub fn router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/request", any(handle_request))
        .route("/request/{*path}", any(handle_request))
        .route("/stats", get(handle_stats))
        .route("/metrics", get(handle_metrics))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_upstream,
        ));

    Router::new()
        .route("/register", get(handle_register))
        .merge(gated)
        .fallback(|| async { (StatusCode::UNAUTHORIZED, "Unauthorized\n") })
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Gate caller-facing endpoints on the source-IP allow-list.
async fn require_upstream(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !state.0.allow.contains(addr.ip()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(request).await
}

/// Agent registration: credential check, upgrade, greeting, then hand the
/// socket to the dispatcher.
async fn handle_register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let secret = match state.0.validator.validate(&headers).await {
        Ok(secret) => secret,
        Err(err) => return registration_error(&state, addr, err, metrics::REG_KEY_FAILED),
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            let err = TunnelError::Transport(format!("http upgrade failed: {rejection}"));
            return registration_error(&state, addr, err, metrics::REG_UPGRADE_FAILED);
        }
    };

    ws.on_upgrade(move |socket| register_tunnel(state, socket, addr, secret))
}

/// Runs on the upgraded socket: read the greeting, then register the pool.
/// Past this point failures cannot be reported over HTTP; the socket is
/// simply closed.
async fn register_tunnel(state: AppState, socket: WebSocket, addr: SocketAddr, secret: String) {
    let mut transport = FrameTransport::from_websocket(socket);

    let greeting = tokio::time::timeout(HANDSHAKE_TIMEOUT, transport.stream.next()).await;
    let handshake = match parse_greeting(greeting) {
        Ok(handshake) => handshake,
        Err(err) => {
            warn!(peer = %addr, error = %err, "registration failed");
            state.metrics().record_registration(metrics::REG_GREETING_FAILED);
            let _ = transport.sink.send(Frame::Close).await;
            return;
        }
    };

    let registration = PoolRegistration {
        handshake,
        transport,
        peer: addr.to_string(),
        secret,
    };
    if state.server().register(registration).await {
        state.metrics().record_registration(metrics::REG_SUCCESS);
    }
}

type GreetingRead = Result<Option<Result<Frame, TunnelError>>, tokio::time::error::Elapsed>;

fn parse_greeting(greeting: GreetingRead) -> TunnelResult<Handshake> {
    let frame = match greeting {
        Err(_) => return Err(TunnelError::Greeting("timed out waiting for greeting".into())),
        Ok(None) => return Err(TunnelError::Greeting("peer hung up before greeting".into())),
        Ok(Some(Err(err))) => return Err(TunnelError::Greeting(err.to_string())),
        Ok(Some(Ok(frame))) => frame,
    };

    let Frame::Text(json) = frame else {
        return Err(TunnelError::Greeting("greeting was not a text frame".into()));
    };

    let handshake: Handshake =
        serde_json::from_str(&json).map_err(|err| TunnelError::Greeting(err.to_string()))?;
    handshake.validate()?;
    Ok(handshake)
}

/// Proxy one external request down a tunnel.
async fn handle_request(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    match proxy_request(&state, addr, request).await {
        Ok(response) => {
            state
                .metrics()
                .record_request_status(response.status().as_u16());
            response
        }
        Err(err) => {
            error!(peer = %addr, error = %err, "request failed");
            state.metrics().record_request_status(PROXY_ERROR_CODE);
            error_response(&err)
        }
    }
}

async fn proxy_request(
    state: &AppState,
    addr: SocketAddr,
    request: Request,
) -> TunnelResult<Response> {
    let (parts, body) = request.into_parts();

    // Destination override, else the inbound URL with the routing prefix
    // stripped.
    let url = match parts.headers.get(DESTINATION_HEADER) {
        Some(value) => {
            let raw = value
                .to_str()
                .map_err(|_| TunnelError::InvalidData("unreadable destination header".into()))?;
            Url::parse(raw)
                .map_err(|err| {
                    TunnelError::InvalidData(format!("parsing {DESTINATION_HEADER} header: {err}"))
                })?
                .to_string()
        }
        None => strip_request_prefix(&parts.uri),
    };

    if state.server().pool_count() == 0 {
        return Err(TunnelError::NoPools);
    }

    let target = match &state.config().id_header {
        Some(header) => {
            let value = parts
                .headers
                .get(header)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            if value.is_empty() {
                return Err(TunnelError::MissingClientId(header.clone()));
            }
            Some(PoolKey::new(value))
        }
        None => None,
    };

    let socket = state.server().dispatch(target).await?;

    // Past this point there is a socket in hand; every failure runs
    // through one funnel and the error taxonomy decides the close.
    let outcome = exchange_on(state, &socket, parts, body, url, addr).await;
    if let Err(err) = &outcome {
        if err.closes_socket() {
            // Throw the socket away; the protocol position is unknown.
            socket.close(&format!("proxy error: {err}")).await;
        }
    }
    outcome
}

/// Everything between dispatch and the response: collect the body, build
/// the wire request, run the exchange.
async fn exchange_on(
    state: &AppState,
    socket: &Arc<TunnelSocket>,
    parts: http::request::Parts,
    body: axum::body::Body,
    url: String,
    addr: SocketAddr,
) -> TunnelResult<Response> {
    // The wire carries the body as one binary frame, so collect it here,
    // bounded by the configured cap.
    let body = axum::body::to_bytes(body, state.config().max_body_bytes)
        .await
        .map_err(|err| TunnelError::Transport(format!("reading request body: {err}")))?;

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();

    let request_uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let tunneled = TunneledRequest::new(
        &parts.method,
        url,
        &parts.headers,
        body.len() as i64,
        addr.to_string(),
        host,
        format!("{:?}", parts.version),
        request_uri,
    );

    proxy_exchange(Arc::clone(socket), &tunneled, body)
        .await
        .map_err(|err| {
            TunnelError::Transport(format!("tunneling failure, connection closed: {err}"))
        })
}

/// The caller hits `/request/<path>`; the agent sees `/<path>`.
fn strip_request_prefix(uri: &http::Uri) -> String {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let stripped = path_and_query
        .strip_prefix("/request")
        .unwrap_or(path_and_query);
    if stripped.is_empty() {
        "/".to_string()
    } else {
        stripped.to_string()
    }
}

async fn handle_stats(State(state): State<AppState>) -> Response {
    match state.server().stats().await {
        Some(stats) => Json(stats).into_response(),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "dispatcher is shutting down\n",
        )
            .into_response(),
    }
}

async fn handle_metrics(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics().export_prometheus(),
    )
        .into_response()
}

fn registration_error(
    state: &AppState,
    addr: SocketAddr,
    err: TunnelError,
    outcome: &'static str,
) -> Response {
    error!(peer = %addr, error = %err, "registration failed");
    state.metrics().record_registration(outcome);
    error_response(&err)
}

fn error_response(err: &TunnelError) -> Response {
    let status =
        StatusCode::from_u16(PROXY_ERROR_CODE).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, format!("{err}\n")).into_response()
}
