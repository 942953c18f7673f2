//! One request/response exchange over a Busy tunnel socket.
//!
//! Four strictly ordered steps: send the serialized request and its body
//! down the tunnel, read back the response metadata, build the caller's
//! response head, then stream the response body frame straight through.
//! Any failure short-circuits; the caller closes the socket with the
//! returned error as the reason. On success the socket gives itself back
//! to the pool once the body frame has been relayed.

use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures_util::SinkExt;
use http::header::{HeaderName, HeaderValue};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use culvert_common::{TunnelError, TunnelResult};
use culvert_wire::{TunneledRequest, TunneledResponse};

use crate::socket::TunnelSocket;
use crate::transport::Frame;

/// Headers that describe the hop, not the payload; never copied through.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Proxy one HTTP request over `socket` and return the caller's response.
///
/// The socket must have been taken (Busy) by the dispatcher. If this future
/// is dropped mid-exchange — the external caller gave up — the socket is
/// closed rather than returned in an unknown protocol position.
pub async fn proxy_exchange(
    socket: Arc<TunnelSocket>,
    request: &TunneledRequest,
    body: Bytes,
) -> TunnelResult<Response> {
    let mut guard = AbandonGuard {
        socket: Some(Arc::clone(&socket)),
    };

    let result = run_exchange(&socket, request, body).await;
    guard.socket = None;
    result
}

async fn run_exchange(
    socket: &Arc<TunnelSocket>,
    request: &TunneledRequest,
    body: Bytes,
) -> TunnelResult<Response> {
    socket.mark_served();

    // [1] Serialize the request, then pipe metadata and body down the
    // tunnel. The writer guard is dropped before any wait on the reader.
    let metadata = serde_json::to_string(request)?;
    {
        let mut sink = socket.writer().await;
        sink.send(Frame::Text(metadata))
            .await
            .map_err(|err| step("writing request", err))?;
        sink.send(Frame::Binary(body))
            .await
            .map_err(|err| step("piping request body", err))?;
    }

    // [2] The agent answers with a text frame of response metadata.
    let frame = next_exchange_frame(socket, "response header").await?;
    let Frame::Text(json) = frame else {
        return Err(TunnelError::InvalidData(
            "response header was not a text frame".to_string(),
        ));
    };
    let head: TunneledResponse = serde_json::from_str(&json)?;

    // [3] Build the caller's response head. Nothing fallible may happen
    // after the body task is spawned, so this comes first.
    let status = http::StatusCode::from_u16(head.status_code)
        .map_err(|_| TunnelError::InvalidData(format!("bad status code {}", head.status_code)))?;

    let mut headers = http::HeaderMap::new();
    for (name, values) in &head.header {
        if HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }

    // [4] Relay the body frame through a channel-backed body. The task
    // outlives this function: once the head is on the wire the only way to
    // signal failure is to break the body off short.
    let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(1);
    let relay = Arc::clone(socket);
    tokio::spawn(async move {
        match next_exchange_frame(&relay, "response body").await {
            Ok(Frame::Binary(data)) => {
                if !data.is_empty() {
                    let _ = body_tx.send(Ok(data)).await;
                }
                relay.give().await;
            }
            Ok(_) => {
                let reason = "response body was not a binary frame";
                let _ = body_tx.send(Err(std::io::Error::other(reason))).await;
                relay.close(reason).await;
            }
            Err(err) => {
                let _ = body_tx
                    .send(Err(std::io::Error::other(err.to_string())))
                    .await;
                relay.close(&format!("piping response body: {err}")).await;
            }
        }
    });

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(body_rx)));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Hand a slot to the reader and wait for the next data frame.
async fn next_exchange_frame(socket: &TunnelSocket, what: &str) -> TunnelResult<Frame> {
    let slot = socket.next_frame_slot().await?;
    slot.await
        .map_err(|_| TunnelError::InvalidData(format!("no {what} reader")))
}

fn step(name: &'static str, err: TunnelError) -> TunnelError {
    TunnelError::Transport(format!("{name}: {err}"))
}

/// Closes the socket if the exchange future is dropped before finishing.
struct AbandonGuard {
    socket: Option<Arc<TunnelSocket>>,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            tokio::spawn(async move {
                socket.close(&TunnelError::CallerGone.to_string()).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::Status;
    use crate::transport::{FrameTransport, LoopbackPeer};
    use culvert_wire::PoolKey;
    use futures_util::StreamExt;
    use std::collections::HashMap;
    use std::time::Duration;

    fn request() -> TunneledRequest {
        TunneledRequest {
            method: "GET".to_string(),
            url: "http://localhost/ping".to_string(),
            ..TunneledRequest::default()
        }
    }

    fn spawn_busy_socket() -> (
        Arc<TunnelSocket>,
        LoopbackPeer,
        mpsc::Receiver<Arc<TunnelSocket>>,
    ) {
        let (transport, peer) = FrameTransport::loopback(8);
        let (idle_tx, idle_rx) = mpsc::channel(8);
        let socket =
            TunnelSocket::start(PoolKey::new("pool"), "127.0.0.1:9".to_string(), transport, idle_tx);
        assert!(socket.take());
        (socket, peer, idle_rx)
    }

    /// Plays the agent's half of one exchange over the loopback peer.
    ///
    /// Returns the peer so the caller keeps the transport alive while it
    /// asserts; dropping it reads as a hangup to the socket's reader.
    async fn agent_replies(
        mut peer: LoopbackPeer,
        head: TunneledResponse,
        body: &'static [u8],
    ) -> LoopbackPeer {
        // Consume the request metadata and body frames.
        assert!(matches!(peer.incoming.next().await, Some(Frame::Text(_))));
        assert!(matches!(peer.incoming.next().await, Some(Frame::Binary(_))));

        let json = serde_json::to_string(&head).unwrap();
        peer.outgoing.send(Ok(Frame::Text(json))).await.unwrap();
        peer.outgoing
            .send(Ok(Frame::Binary(Bytes::from_static(body))))
            .await
            .unwrap();

        peer
    }

    #[tokio::test]
    async fn happy_path_round_trip() {
        let (socket, peer, mut idle_rx) = spawn_busy_socket();

        let mut header = HashMap::new();
        header.insert("x-origin".to_string(), vec!["agent".to_string()]);
        let head = TunneledResponse::new(200, header, 4);
        let agent = tokio::spawn(agent_replies(peer, head, b"pong"));

        let response = proxy_exchange(Arc::clone(&socket), &request(), Bytes::new())
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["x-origin"], "agent");

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"pong");

        // The socket went back to Idle and re-queued itself.
        let queued = tokio::time::timeout(Duration::from_secs(1), idle_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&queued, &socket));
        assert_eq!(socket.status(), Status::Idle);
        assert_eq!(socket.served(), 1);

        let _peer = agent.await.unwrap();
    }

    #[tokio::test]
    async fn hop_by_hop_headers_are_dropped() {
        let (socket, peer, _idle) = spawn_busy_socket();

        let mut header = HashMap::new();
        header.insert("Transfer-Encoding".to_string(), vec!["chunked".to_string()]);
        header.insert("X-Keep".to_string(), vec!["yes".to_string()]);
        let head = TunneledResponse::new(200, header, 0);
        let agent = tokio::spawn(agent_replies(peer, head, b""));

        let response = proxy_exchange(Arc::clone(&socket), &request(), Bytes::new())
            .await
            .unwrap();
        assert!(response.headers().get("transfer-encoding").is_none());
        assert_eq!(response.headers()["x-keep"], "yes");

        let _peer = agent.await.unwrap();
    }

    #[tokio::test]
    async fn garbage_metadata_fails_the_exchange() {
        let (socket, mut peer, _idle) = spawn_busy_socket();

        tokio::spawn(async move {
            assert!(matches!(peer.incoming.next().await, Some(Frame::Text(_))));
            assert!(matches!(peer.incoming.next().await, Some(Frame::Binary(_))));
            peer.outgoing
                .send(Ok(Frame::Text("not json".to_string())))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let err = proxy_exchange(Arc::clone(&socket), &request(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Serialize(_)));

        // Closing on error is the entry point's job; the exchange reports.
        assert_eq!(socket.status(), Status::Busy);
    }

    #[tokio::test]
    async fn body_read_error_truncates_and_closes() {
        let (socket, mut peer, _idle) = spawn_busy_socket();

        tokio::spawn(async move {
            assert!(matches!(peer.incoming.next().await, Some(Frame::Text(_))));
            assert!(matches!(peer.incoming.next().await, Some(Frame::Binary(_))));
            let head = serde_json::to_string(&TunneledResponse::new(200, HashMap::new(), 4)).unwrap();
            peer.outgoing.send(Ok(Frame::Text(head))).await.unwrap();
            // The body read fails at the transport.
            peer.outgoing
                .send(Err(TunnelError::Transport("reset mid-body".into())))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let response = proxy_exchange(Arc::clone(&socket), &request(), Bytes::new())
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        // The head was already committed; the body breaks off instead.
        let body = axum::body::to_bytes(response.into_body(), 1024).await;
        assert!(body.is_err());

        tokio::time::timeout(Duration::from_secs(1), async {
            while socket.status() != Status::Closed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("socket should close after a body failure");
    }

    #[tokio::test]
    async fn abandoned_exchange_closes_the_socket() {
        let (socket, _peer, _idle) = spawn_busy_socket();

        // The agent never answers, and the caller gives up: the handler
        // future is dropped mid-exchange.
        let req = request();
        tokio::select! {
            biased;
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            _ = proxy_exchange(Arc::clone(&socket), &req, Bytes::new()) => {
                panic!("exchange should still be waiting on the agent");
            }
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while socket.status() != Status::Closed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dropping the exchange should close the socket");
    }

    #[tokio::test]
    async fn closed_socket_surfaces_no_reader() {
        let (socket, mut peer, _idle) = spawn_busy_socket();

        tokio::spawn(async move {
            assert!(matches!(peer.incoming.next().await, Some(Frame::Text(_))));
            assert!(matches!(peer.incoming.next().await, Some(Frame::Binary(_))));
            // The agent vanishes instead of answering.
            drop(peer);
        });

        let err = proxy_exchange(Arc::clone(&socket), &request(), Bytes::new())
            .await
            .unwrap_err();
        match err {
            TunnelError::InvalidData(msg) => assert!(msg.contains("no response header reader")),
            TunnelError::Closed(_) => {}
            other => panic!("unexpected error: {other}"),
        }
    }
}
