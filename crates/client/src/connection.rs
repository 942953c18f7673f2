//! One agent-side tunnel connection: dial, greet, then serve requests.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::header::HeaderValue;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

use culvert_common::{TunnelError, TunnelResult};
use culvert_wire::{TunneledRequest, TunneledResponse, SECRET_KEY_HEADER};

use crate::pool::{ConnectionHandle, PoolShared, IDLE, RUNNING};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(55);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SharedSink = Arc<tokio::sync::Mutex<SplitSink<WsStream, Message>>>;

/// Dial the server, send the greeting, and serve requests until the
/// connection dies or the pool shuts down.
pub(crate) async fn run(shared: Arc<PoolShared>, handle: ConnectionHandle) -> TunnelResult<()> {
    debug!(target = %shared.target, conn = %handle.id, "connecting to tunnel");

    let mut request = shared
        .target
        .as_str()
        .into_client_request()
        .map_err(|err| TunnelError::InvalidData(format!("bad target URL: {err}")))?;
    request.headers_mut().insert(
        SECRET_KEY_HEADER,
        HeaderValue::from_str(&shared.config.secret_key)
            .map_err(|_| TunnelError::InvalidData("secret key is not header-safe".into()))?,
    );

    let (ws, _response) = connect_async(request)
        .await
        .map_err(|err| TunnelError::Transport(format!("dialing tunnel: {err}")))?;

    let (sink, stream) = ws.split();
    let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));

    // The greeting must be the first frame the server sees.
    let greeting = serde_json::to_string(&shared.config.handshake())?;
    sink.lock()
        .await
        .send(Message::Text(greeting.into()))
        .await
        .map_err(|err| TunnelError::Transport(format!("sending greeting: {err}")))?;

    shared.note_dial_success();
    info!(target = %shared.target, conn = %handle.id, "tunnel registered");

    let keepalive = spawn_keepalive(Arc::clone(&sink), handle.clone());
    let result = serve(&shared, &handle, stream, &sink).await;
    keepalive.abort();
    result
}

/// Ping the server periodically so half-dead links are noticed.
fn spawn_keepalive(sink: SharedSink, handle: ConnectionHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(KEEPALIVE_INTERVAL);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = handle.cancel.cancelled() => return,
                _ = tick.tick() => {}
            }

            let ping = async {
                sink.lock()
                    .await
                    .send(Message::Ping(Bytes::new()))
                    .await
            };
            match tokio::time::timeout(KEEPALIVE_TIMEOUT, ping).await {
                Ok(Ok(())) => {}
                _ => {
                    error!(conn = %handle.id, "tunnel keep-alive failed");
                    return;
                }
            }
        }
    })
}

/// The serve loop: wait for a request, execute it, stream the response
/// back. One exchange at a time, matching the server's per-socket
/// contract.
async fn serve(
    shared: &Arc<PoolShared>,
    handle: &ConnectionHandle,
    mut stream: SplitStream<WsStream>,
    sink: &SharedSink,
) -> TunnelResult<()> {
    loop {
        handle.set_status(IDLE);

        let message = tokio::select! {
            _ = handle.cancel.cancelled() => return Ok(()),
            message = stream.next() => message,
        };

        let json = match message {
            None => return Err(TunnelError::Transport("server hung up".into())),
            Some(Err(err)) => {
                return Err(TunnelError::Transport(format!("waiting for request: {err}")))
            }
            Some(Ok(Message::Text(text))) => text.to_string(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) => return Ok(()),
            Some(Ok(_)) => {
                return Err(TunnelError::InvalidData(
                    "expected request metadata frame".into(),
                ))
            }
        };

        handle.set_status(RUNNING);
        // Start dialing a replacement while this one is occupied.
        shared.request_topup();

        let request: TunneledRequest = match serde_json::from_str(&json) {
            Ok(request) => request,
            Err(err) => {
                let msg = format!("deserializing tunneled request: {err}");
                send_client_error(sink, &msg).await?;
                return Err(TunnelError::InvalidData(msg));
            }
        };

        // The body always follows as one binary frame.
        let body = match stream.next().await {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(_)) => {
                return Err(TunnelError::InvalidData("expected request body frame".into()))
            }
            Some(Err(err)) => {
                return Err(TunnelError::Transport(format!("reading request body: {err}")))
            }
            None => return Err(TunnelError::Transport("server hung up mid-request".into())),
        };

        debug!(conn = %handle.id, method = %request.method, url = %request.url, "executing tunneled request");

        let (head, body) = match execute(shared, request, body).await {
            Ok(pair) => pair,
            Err(err) => {
                // Local failure: answer with the agent-error status so the
                // caller sees what happened; the tunnel itself is fine.
                let msg = format!("executing tunneled request: {err}");
                error!(conn = %handle.id, "{msg}");
                (
                    TunneledResponse::client_error(msg.len() as i64),
                    Bytes::from(msg),
                )
            }
        };

        let metadata = serde_json::to_string(&head)?;
        let mut sink = sink.lock().await;
        sink.send(Message::Text(metadata.into()))
            .await
            .map_err(|err| TunnelError::Transport(format!("writing response: {err}")))?;
        sink.send(Message::Binary(body))
            .await
            .map_err(|err| TunnelError::Transport(format!("writing response body: {err}")))?;
    }
}

/// Run the request through the custom handler or the built-in HTTP client.
async fn execute(
    shared: &Arc<PoolShared>,
    request: TunneledRequest,
    body: Bytes,
) -> TunnelResult<(TunneledResponse, Bytes)> {
    if let Some(handler) = &shared.config.handler {
        return handler.handle(request, body).await;
    }

    let method = http::Method::from_bytes(request.method.as_bytes())
        .map_err(|_| TunnelError::InvalidData(format!("bad method {}", request.method)))?;
    let url = reqwest::Url::parse(&request.url)
        .map_err(|err| TunnelError::InvalidData(format!("request URL is not absolute: {err}")))?;

    let mut headers = http::HeaderMap::new();
    for (name, values) in &request.header {
        let Ok(name) = http::header::HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }

    let response = shared
        .http
        .request(method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|err| TunnelError::Transport(format!("local request failed: {err}")))?;

    let status = response.status().as_u16();
    let header = culvert_wire::headers_to_wire(response.headers());
    let bytes = response
        .bytes()
        .await
        .map_err(|err| TunnelError::Transport(format!("reading local response: {err}")))?;

    Ok((
        TunneledResponse::new(status, header, bytes.len() as i64),
        bytes,
    ))
}

/// Report a request-level failure with the reserved agent-error status.
async fn send_client_error(sink: &SharedSink, msg: &str) -> TunnelResult<()> {
    let head = serde_json::to_string(&TunneledResponse::client_error(msg.len() as i64))?;
    let mut sink = sink.lock().await;
    sink.send(Message::Text(head.into()))
        .await
        .map_err(|err| TunnelError::Transport(format!("writing error response: {err}")))?;
    sink.send(Message::Binary(Bytes::from(msg.to_string())))
        .await
        .map_err(|err| TunnelError::Transport(format!("writing error response body: {err}")))?;
    Ok(())
}
