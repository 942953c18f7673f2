//! One tunnel socket: lifecycle state machine plus its dedicated reader.
//!
//! Every socket is owned by exactly one pool from registration to close.
//! The state machine is Idle → Busy → Idle per exchange, with Closed as the
//! terminal state on any error, eviction, or shutdown. All reads funnel
//! through a single reader task so control frames are serviced even while
//! no exchange is in flight, and so an exchange can never race another
//! reader for a frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use culvert_common::{TunnelError, TunnelResult};
use culvert_wire::PoolKey;

use crate::transport::{Frame, FrameSink, FrameStream, FrameTransport};

/// Lifecycle state of a tunnel socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Idle,
    Busy,
    Closed,
}

struct SocketState {
    status: Status,
    idle_since: Instant,
}

/// A single websocket tunnel from an agent, wrapped in the Idle/Busy/Closed
/// state machine the dispatcher relies on.
pub struct TunnelSocket {
    key: PoolKey,
    peer: String,
    state: Mutex<SocketState>,
    /// Exchanges hand fresh frame slots to the reader through here.
    next_frame: mpsc::Sender<oneshot::Sender<Frame>>,
    sink: tokio::sync::Mutex<FrameSink>,
    /// The owning pool's idle queue; `give` re-enqueues through it.
    idle: mpsc::Sender<Arc<TunnelSocket>>,
    served: AtomicU64,
    connected_at: Instant,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TunnelSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSocket")
            .field("key", &self.key)
            .field("peer", &self.peer)
            .field("status", &self.status())
            .field("served", &self.served())
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

impl TunnelSocket {
    /// Wrap a transport and start its reader task. The socket starts Idle
    /// but is not queued; the pool enqueues it with [`TunnelSocket::give`].
    pub fn start(
        key: PoolKey,
        peer: String,
        transport: FrameTransport,
        idle: mpsc::Sender<Arc<TunnelSocket>>,
    ) -> Arc<Self> {
        let (slot_tx, slot_rx) = mpsc::channel(1);

        let socket = Arc::new(Self {
            key,
            peer,
            state: Mutex::new(SocketState {
                status: Status::Idle,
                idle_since: Instant::now(),
            }),
            next_frame: slot_tx,
            sink: tokio::sync::Mutex::new(transport.sink),
            idle,
            served: AtomicU64::new(0),
            connected_at: Instant::now(),
            cancel: CancellationToken::new(),
        });

        let reader = Arc::clone(&socket);
        tokio::spawn(async move {
            reader.read_loop(transport.stream, slot_rx).await;
        });

        socket
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    /// Lifetime count of exchanges started on this socket.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_served(&self) {
        self.served.fetch_add(1, Ordering::Relaxed);
    }

    /// Claim the socket for an exchange. Atomic: ties are lost by later
    /// callers, and a Busy or Closed socket cannot be taken.
    pub fn take(&self) -> bool {
        let mut state = self.state.lock();
        match state.status {
            Status::Idle => {
                state.status = Status::Busy;
                true
            }
            Status::Busy | Status::Closed => false,
        }
    }

    /// Return the socket to the pool after a successful exchange.
    ///
    /// If the idle queue is at capacity the agent opened far more sockets
    /// than it declared; the socket is shed instead of queued.
    pub async fn give(self: &Arc<Self>) {
        let overflow = {
            let mut state = self.state.lock();
            if state.status == Status::Closed {
                return;
            }
            state.status = Status::Idle;
            state.idle_since = Instant::now();
            self.idle.try_send(Arc::clone(self)).is_err()
        };

        if overflow {
            self.close("idle buffer at capacity").await;
        }
    }

    /// Close the socket. Idempotent; the first caller wins and later calls
    /// return without side effects.
    pub async fn close(&self, reason: &str) {
        if !self.begin_close() {
            return;
        }
        self.finish_close(reason).await;
    }

    /// Transition to Closed only if the socket has sat Idle longer than
    /// `timeout`. Returns the idle age when the eviction won the race.
    /// The caller must follow up with [`TunnelSocket::finish_close`].
    pub(crate) fn begin_idle_eviction(&self, timeout: Duration) -> Option<Duration> {
        let mut state = self.state.lock();
        if state.status != Status::Idle {
            return None;
        }
        let age = state.idle_since.elapsed();
        if age <= timeout {
            return None;
        }
        state.status = Status::Closed;
        Some(age)
    }

    fn begin_close(&self) -> bool {
        let mut state = self.state.lock();
        if state.status == Status::Closed {
            return false;
        }
        state.status = Status::Closed;
        true
    }

    /// Tear down after the state is already Closed: unblock the reader,
    /// close the underlying channel, and log the socket's life summary.
    pub(crate) async fn finish_close(&self, reason: &str) {
        self.cancel.cancel();

        let mut sink = self.sink.lock().await;
        let _ = sink.send(Frame::Close).await;
        let _ = sink.close().await;
        drop(sink);

        info!(
            pool = %self.key,
            peer = %self.peer,
            uptime_s = self.connected_at.elapsed().as_secs(),
            requests = self.served(),
            reason,
            "closing tunnel socket",
        );
    }

    /// Exclusive access to the write half for the duration of an exchange
    /// step. Never hold the guard across a frame-slot wait.
    pub(crate) async fn writer(&self) -> tokio::sync::MutexGuard<'_, FrameSink> {
        self.sink.lock().await
    }

    /// Hand a fresh slot to the reader and return the receiving end. The
    /// next inbound data frame lands in the slot.
    pub(crate) async fn next_frame_slot(&self) -> TunnelResult<oneshot::Receiver<Frame>> {
        let (tx, rx) = oneshot::channel();
        self.next_frame
            .send(tx)
            .await
            .map_err(|_| TunnelError::Closed("reader is gone".to_string()))?;
        Ok(rx)
    }

    /// Point-in-time stats for the stats endpoint.
    pub fn snapshot(&self) -> SocketSnapshot {
        let (status, idle_s) = {
            let state = self.state.lock();
            let idle_s = match state.status {
                Status::Idle => state.idle_since.elapsed().as_secs(),
                _ => 0,
            };
            (state.status, idle_s)
        };

        SocketSnapshot {
            status,
            idle_s,
            uptime_s: self.connected_at.elapsed().as_secs(),
            requests: self.served(),
        }
    }

    /// The reader: the only task allowed to pull frames off the stream.
    ///
    /// Loop: read a frame; skip control frames; any frame outside an
    /// exchange is a protocol violation; otherwise wait for the exchange to
    /// hand over a slot and deliver the frame into it.
    async fn read_loop(
        self: Arc<Self>,
        mut stream: FrameStream,
        mut slots: mpsc::Receiver<oneshot::Sender<Frame>>,
    ) {
        loop {
            if self.status() == Status::Closed {
                return;
            }

            let next = tokio::select! {
                _ = self.cancel.cancelled() => return,
                next = stream.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    self.close(&format!("read error: {err}")).await;
                    return;
                }
                None => {
                    self.close("peer hung up").await;
                    return;
                }
            };

            match frame {
                // The websocket layer already answers pings; nothing to do.
                Frame::Ping(_) | Frame::Pong(_) => continue,
                Frame::Close => {
                    self.close("peer sent close").await;
                    return;
                }
                Frame::Text(_) | Frame::Binary(_) => {}
            }

            if self.status() != Status::Busy {
                // An agent wrote outside an exchange. Throw the socket away
                // rather than guess what it meant.
                self.close("unexpected frame while not busy").await;
                return;
            }

            let slot = tokio::select! {
                _ = self.cancel.cancelled() => return,
                slot = slots.recv() => slot,
            };

            let Some(slot) = slot else { return };

            if slot.send(frame).is_err() {
                // The exchange gave up (caller disconnect) between handing
                // over the slot and the frame arriving.
                debug!(pool = %self.key, "exchange abandoned its frame slot");
            }
        }
    }
}

/// Per-socket stats echoed by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SocketSnapshot {
    pub status: Status,
    #[serde(rename = "idleSeconds")]
    pub idle_s: u64,
    #[serde(rename = "uptimeSeconds")]
    pub uptime_s: u64,
    pub requests: u64,
}
