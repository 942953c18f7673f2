//! Per-agent connection pool.
//!
//! A pool owns every socket belonging to one canonical agent id. A private
//! coordinator task is the sole mutator of the socket set and the lifetime
//! closed counter; everything external goes through messages. The idle
//! queue is a bounded channel the dispatcher's workers receive from in FIFO
//! order.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use culvert_wire::{Handshake, PoolKey};

use crate::socket::{SocketSnapshot, Status, TunnelSocket};
use crate::transport::FrameTransport;

/// Shared receiving end of a pool's idle queue.
///
/// Multiple dispatch workers take sockets from the same queue; the mutex
/// serializes them while preserving the channel's FIFO order.
pub type IdleReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<TunnelSocket>>>>;

enum PoolCmd {
    Register {
        transport: FrameTransport,
        peer: String,
        handshake: Handshake,
    },
    /// Run a reap pass and report whether the pool came out empty.
    Reap { reply: oneshot::Sender<ReapReport> },
    Size { reply: oneshot::Sender<PoolSize> },
    Shutdown,
}

/// Result of a reap pass.
#[derive(Debug, Clone, Copy)]
pub struct ReapReport {
    pub empty: bool,
    /// Sockets collected over the pool's lifetime.
    pub closed_total: u64,
}

/// Snapshot of a pool's sockets by state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolSize {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    /// Sockets closed over the pool's lifetime, including ones not yet
    /// collected by the reaper.
    pub closed: u64,
    pub conns: Vec<SocketSnapshot>,
    #[serde(skip)]
    pub handshake: Handshake,
    /// Idle queue occupancy, reported separately by the stats endpoint.
    #[serde(skip)]
    pub queue_len: usize,
    #[serde(skip)]
    pub queue_capacity: usize,
}

/// Handle to one pool's coordinator task. Cheap to clone.
#[derive(Clone)]
pub struct PoolHandle {
    key: PoolKey,
    cmds: mpsc::Sender<PoolCmd>,
    idle_rx: IdleReceiver,
    connected_at: chrono::DateTime<chrono::Utc>,
}

impl PoolHandle {
    /// Create the pool and start its coordinator.
    ///
    /// The idle queue is sized at a multiple of the handshake's `max` so a
    /// reconnect storm does not instantly trip the overflow policy while
    /// the prior generation of sockets awaits the reaper.
    pub fn spawn(
        key: PoolKey,
        handshake: &Handshake,
        idle_timeout: Duration,
        idle_buffer_multiple: usize,
    ) -> Self {
        let capacity = (handshake.max_size * idle_buffer_multiple).max(1);
        let (idle_tx, idle_rx) = mpsc::channel(capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let idle_rx = Arc::new(tokio::sync::Mutex::new(idle_rx));

        let pool = Pool {
            key: key.clone(),
            idle_timeout,
            min_idle: handshake.size + 1,
            handshake: handshake.clone(),
            sockets: Vec::new(),
            closed: 0,
            idle_tx,
            idle_rx: Arc::clone(&idle_rx),
        };
        tokio::spawn(pool.run(cmd_rx));

        Self {
            key,
            cmds: cmd_tx,
            idle_rx,
            connected_at: chrono::Utc::now(),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn connected_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.connected_at
    }

    /// The queue dispatch workers receive idle sockets from.
    pub(crate) fn idle_receiver(&self) -> IdleReceiver {
        Arc::clone(&self.idle_rx)
    }

    /// Hand a freshly upgraded tunnel to the pool.
    pub async fn register(&self, transport: FrameTransport, peer: String, handshake: Handshake) {
        let _ = self
            .cmds
            .send(PoolCmd::Register {
                transport,
                peer,
                handshake,
            })
            .await;
    }

    /// Run a reap pass. A dead coordinator reads as an empty pool.
    pub async fn reap(&self) -> ReapReport {
        let (tx, rx) = oneshot::channel();
        if self.cmds.send(PoolCmd::Reap { reply: tx }).await.is_err() {
            return ReapReport {
                empty: true,
                closed_total: 0,
            };
        }
        rx.await.unwrap_or(ReapReport {
            empty: true,
            closed_total: 0,
        })
    }

    pub async fn size(&self) -> Option<PoolSize> {
        let (tx, rx) = oneshot::channel();
        self.cmds.send(PoolCmd::Size { reply: tx }).await.ok()?;
        rx.await.ok()
    }

    /// Close every socket and stop the coordinator.
    pub async fn shutdown(&self) {
        let _ = self.cmds.send(PoolCmd::Shutdown).await;
    }
}

struct Pool {
    key: PoolKey,
    idle_timeout: Duration,
    /// Idle sockets below this count are never age-evicted. One above the
    /// agent's declared size, so a pool at its target is not churned.
    min_idle: usize,
    handshake: Handshake,
    sockets: Vec<Arc<TunnelSocket>>,
    /// Lifetime count of collected sockets.
    closed: u64,
    idle_tx: mpsc::Sender<Arc<TunnelSocket>>,
    idle_rx: IdleReceiver,
}

impl Pool {
    async fn run(mut self, mut cmds: mpsc::Receiver<PoolCmd>) {
        loop {
            match cmds.recv().await {
                Some(PoolCmd::Register {
                    transport,
                    peer,
                    handshake,
                }) => self.register(transport, peer, handshake).await,
                Some(PoolCmd::Reap { reply }) => {
                    self.reap().await;
                    let _ = reply.send(ReapReport {
                        empty: self.sockets.is_empty(),
                        closed_total: self.closed,
                    });
                }
                Some(PoolCmd::Size { reply }) => {
                    let _ = reply.send(self.size());
                }
                Some(PoolCmd::Shutdown) | None => break,
            }
        }

        for socket in self.sockets.drain(..) {
            socket.close("shutdown").await;
        }
    }

    async fn register(&mut self, transport: FrameTransport, peer: String, handshake: Handshake) {
        info!(pool = %self.key, peer = %peer, "registering new tunnel socket");

        // The latest greeting wins; an agent can resize its pool by
        // reconnecting with different numbers.
        self.min_idle = handshake.size + 1;
        self.handshake = handshake;

        self.drain_stale_idle().await;

        let socket = TunnelSocket::start(self.key.clone(), peer, transport, self.idle_tx.clone());
        self.sockets.push(Arc::clone(&socket));
        socket.give().await;
    }

    /// Remove queue entries whose socket is no longer Idle. Closed sockets
    /// linger in the queue until either a worker skips them or a fresh
    /// registration triggers this drain.
    async fn drain_stale_idle(&self) {
        let mut rx = self.idle_rx.lock().await;
        let mut keep = Vec::new();
        while let Ok(socket) = rx.try_recv() {
            if socket.status() == Status::Idle {
                keep.push(socket);
            }
        }

        let mut overflow = Vec::new();
        for socket in keep {
            if self.idle_tx.try_send(Arc::clone(&socket)).is_err() {
                overflow.push(socket);
            }
        }
        drop(rx);

        for socket in overflow {
            socket.close("idle buffer at capacity").await;
        }
    }

    /// Drop collected sockets and age out surplus idle ones.
    async fn reap(&mut self) {
        let mut kept = Vec::with_capacity(self.sockets.len());
        let mut idle_seen = 0usize;

        for socket in std::mem::take(&mut self.sockets) {
            match socket.status() {
                Status::Closed => {
                    self.closed += 1;
                }
                Status::Idle => {
                    idle_seen += 1;
                    if idle_seen > self.min_idle {
                        if let Some(age) = socket.begin_idle_eviction(self.idle_timeout) {
                            debug!(pool = %self.key, age_s = age.as_secs(), "evicting surplus idle socket");
                            socket.finish_close(&format!("idle {}s", age.as_secs())).await;
                            self.closed += 1;
                            continue;
                        }
                    }
                    kept.push(socket);
                }
                Status::Busy => kept.push(socket),
            }
        }

        self.sockets = kept;
    }

    fn size(&self) -> PoolSize {
        let capacity = self.idle_tx.max_capacity();
        let mut size = PoolSize {
            total: self.sockets.len(),
            closed: self.closed,
            handshake: self.handshake.clone(),
            queue_len: capacity - self.idle_tx.capacity(),
            queue_capacity: capacity,
            ..PoolSize::default()
        };

        for socket in &self.sockets {
            match socket.status() {
                Status::Idle => size.idle += 1,
                Status::Busy => size.busy += 1,
                Status::Closed => size.closed += 1,
            }
            size.conns.push(socket.snapshot());
        }

        size
    }
}
