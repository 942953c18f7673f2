//! Central dispatcher: pool registry plus the workers that match incoming
//! requests to idle sockets.
//!
//! One coordinator task owns the pool map; nothing else ever touches it.
//! Registrations, pool lookups, stats snapshots and the 5 s reaper tick all
//! run on that task. N workers consume dispatch requests in parallel and
//! talk to the coordinator over a request/reply channel pair.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use culvert_common::{TunnelError, TunnelResult};
use culvert_wire::{Handshake, PoolKey};

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::pool::PoolHandle;
use crate::socket::TunnelSocket;
use crate::stats::{PoolStatsEntry, ServerStats};
use crate::transport::FrameTransport;

/// How often empty pools are collected and every pool reaps its sockets.
const CLEAN_INTERVAL: Duration = Duration::from_secs(5);

/// Back-off between polling rounds in any-pool mode, standing in for a
/// select default branch.
const ANY_POOL_POLL: Duration = Duration::from_millis(10);

/// A registration on its way from the register endpoint to the coordinator.
pub struct PoolRegistration {
    pub handshake: Handshake,
    pub transport: FrameTransport,
    pub peer: String,
    /// Secret returned by the credential validator; empty for the built-in
    /// check.
    pub secret: String,
}

struct DispatchRequest {
    /// None requests a socket from any pool.
    target: Option<PoolKey>,
    /// `Ok` carries the taken socket, `Err` a typed dispatch failure.
    /// Dropped without a send when the requested target has no pool.
    reply: oneshot::Sender<TunnelResult<Arc<TunnelSocket>>>,
    deadline: Instant,
    /// The configured dispatch timeout, echoed in timeout errors.
    timeout_ms: u64,
}

enum PoolQuery {
    Get {
        target: PoolKey,
        reply: oneshot::Sender<Option<PoolHandle>>,
    },
    /// Copy of every pool handle; the map itself never crosses the task
    /// boundary.
    Snapshot {
        reply: oneshot::Sender<Vec<PoolHandle>>,
    },
}

struct StatsQuery {
    reply: oneshot::Sender<ServerStats>,
}

/// Handle to the running dispatcher. Cheap to clone; dropping every clone
/// shuts the coordinator down.
#[derive(Clone)]
pub struct TunnelServer {
    config: Arc<ServerConfig>,
    new_pool: mpsc::Sender<PoolRegistration>,
    dispatch: mpsc::Sender<DispatchRequest>,
    stats: mpsc::Sender<StatsQuery>,
    pool_count: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl TunnelServer {
    pub fn start(config: Arc<ServerConfig>, metrics: Arc<Metrics>) -> Self {
        const NEW_POOL_BUFFER: usize = 100;

        let (new_pool_tx, new_pool_rx) = mpsc::channel(NEW_POOL_BUFFER);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(1);
        let (query_tx, query_rx) = mpsc::channel(64);
        let (stats_tx, stats_rx) = mpsc::channel(8);

        let pool_count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let workers = config.dispatchers.max(1);
        let worker_counts: Arc<Vec<AtomicU64>> =
            Arc::new((0..workers).map(|_| AtomicU64::new(0)).collect());

        let dispatch_rx = Arc::new(tokio::sync::Mutex::new(dispatch_rx));
        for id in 0..workers {
            tokio::spawn(worker(
                id,
                Arc::clone(&dispatch_rx),
                query_tx.clone(),
                Arc::clone(&worker_counts),
                cancel.clone(),
            ));
        }

        let coordinator = Coordinator {
            config: Arc::clone(&config),
            metrics,
            pools: HashMap::new(),
            reaped_closed: 0,
            pool_count: Arc::clone(&pool_count),
            worker_counts,
        };
        tokio::spawn(coordinator.run(new_pool_rx, query_rx, stats_rx, cancel.clone()));

        Self {
            config,
            new_pool: new_pool_tx,
            dispatch: dispatch_tx,
            stats: stats_tx,
            pool_count,
            cancel,
        }
    }

    /// Cheap pre-check for the request entry point; reads a published
    /// counter, never the pool map.
    pub fn pool_count(&self) -> usize {
        self.pool_count.load(Ordering::Relaxed)
    }

    /// Queue a registration for the coordinator.
    pub async fn register(&self, registration: PoolRegistration) -> bool {
        self.new_pool.send(registration).await.is_ok()
    }

    /// Ask for an idle socket, transitioned to Busy and exclusively ours.
    ///
    /// Fails with [`TunnelError::NoProxyTarget`] when the target has no
    /// pool and [`TunnelError::Timeout`] when no socket turns idle within
    /// the configured dispatch timeout.
    pub async fn dispatch(&self, target: Option<PoolKey>) -> TunnelResult<Arc<TunnelSocket>> {
        let timeout = self.config.timeout();
        let (tx, rx) = oneshot::channel();
        self.dispatch
            .send(DispatchRequest {
                target: target.clone(),
                reply: tx,
                deadline: Instant::now() + timeout,
                timeout_ms: timeout.as_millis() as u64,
            })
            .await
            .map_err(|_| TunnelError::NoPools)?;

        match rx.await {
            Ok(outcome) => outcome,
            // The worker dropped the reply: the target has no pool.
            Err(_) => Err(TunnelError::NoProxyTarget(
                target.map(|key| key.to_string()).unwrap_or_default(),
            )),
        }
    }

    pub async fn stats(&self) -> Option<ServerStats> {
        let (tx, rx) = oneshot::channel();
        self.stats.send(StatsQuery { reply: tx }).await.ok()?;
        rx.await.ok()
    }

    /// Stop the coordinator and workers and shut every pool down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct Coordinator {
    config: Arc<ServerConfig>,
    metrics: Arc<Metrics>,
    pools: HashMap<PoolKey, PoolHandle>,
    /// Lifetime count of sockets closed under pools this coordinator
    /// reaped.
    reaped_closed: u64,
    pool_count: Arc<AtomicUsize>,
    worker_counts: Arc<Vec<AtomicU64>>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut new_pool: mpsc::Receiver<PoolRegistration>,
        mut queries: mpsc::Receiver<PoolQuery>,
        mut stats: mpsc::Receiver<StatsQuery>,
        cancel: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(CLEAN_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would log an empty reaper pass.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                registration = new_pool.recv() => match registration {
                    Some(registration) => self.register_pool(registration).await,
                    None => break,
                },
                Some(query) = queries.recv() => self.handle_query(query),
                Some(query) = stats.recv() => self.handle_stats(query).await,
                _ = tick.tick() => self.clean_pools().await,
            }
        }

        for (_, pool) in self.pools.drain() {
            pool.shutdown().await;
        }
        self.pool_count.store(0, Ordering::Relaxed);
    }

    /// Find or create the target pool and hand it the new socket.
    async fn register_pool(&mut self, registration: PoolRegistration) {
        let PoolRegistration {
            handshake,
            transport,
            peer,
            secret,
        } = registration;

        let key = PoolKey::canonical(&secret, &handshake.id);
        let pool = self.pools.entry(key.clone()).or_insert_with(|| {
            info!(pool = %key, client = %handshake.name, "creating connection pool");
            PoolHandle::spawn(
                key.clone(),
                &handshake,
                self.config.idle_timeout(),
                self.config.idle_buffer_multiple,
            )
        });

        pool.register(transport, peer, handshake).await;
        self.pool_count.store(self.pools.len(), Ordering::Relaxed);
    }

    fn handle_query(&self, query: PoolQuery) {
        match query {
            PoolQuery::Get { target, reply } => {
                let _ = reply.send(self.pools.get(&target).cloned());
            }
            PoolQuery::Snapshot { reply } => {
                let _ = reply.send(self.pools.values().cloned().collect());
            }
        }
    }

    async fn handle_stats(&self, query: StatsQuery) {
        let mut stats = ServerStats::default();

        for (key, pool) in &self.pools {
            if let Some(size) = pool.size().await {
                stats
                    .pools
                    .insert(key.to_string(), PoolStatsEntry::new(pool, size));
            }
        }

        for (id, count) in self.worker_counts.iter().enumerate() {
            stats
                .threads
                .insert(id.to_string(), count.load(Ordering::Relaxed));
        }

        let _ = query.reply.send(stats);
    }

    /// Reap every pool, drop the empty ones, refresh the aggregate gauges.
    async fn clean_pools(&mut self) {
        if self.pools.is_empty() {
            return;
        }

        let mut removed = Vec::new();
        for (key, pool) in &self.pools {
            let report = pool.reap().await;
            if report.empty {
                removed.push(key.clone());
                self.reaped_closed += report.closed_total;
            }
        }

        for key in removed {
            if let Some(pool) = self.pools.remove(&key) {
                info!(pool = %key, "removing empty connection pool");
                pool.shutdown().await;
            }
        }

        let mut conns = 0;
        let mut idle = 0;
        let mut busy = 0;
        let mut histogram: BTreeMap<usize, usize> = BTreeMap::new();
        for pool in self.pools.values() {
            if let Some(size) = pool.size().await {
                conns += size.total;
                idle += size.idle;
                busy += size.busy;
                *histogram
                    .entry(size.total.min(Metrics::HISTOGRAM_CAP))
                    .or_default() += 1;
            }
        }

        self.pool_count.store(self.pools.len(), Ordering::Relaxed);
        self.metrics.set_pool_gauges(
            self.pools.len(),
            conns,
            idle,
            busy,
            self.reaped_closed,
            histogram,
        );

        info!(
            pools = self.pools.len(),
            conns,
            idle,
            busy,
            closed = self.reaped_closed,
            "pool reaper pass",
        );
    }
}

async fn worker(
    id: usize,
    dispatch: Arc<tokio::sync::Mutex<mpsc::Receiver<DispatchRequest>>>,
    queries: mpsc::Sender<PoolQuery>,
    counts: Arc<Vec<AtomicU64>>,
    cancel: CancellationToken,
) {
    loop {
        let request = {
            let mut rx = dispatch.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                request = rx.recv() => request,
            }
        };

        let Some(request) = request else { return };
        counts[id].fetch_add(1, Ordering::Relaxed);
        dispatch_request(request, &queries).await;
    }
}

/// Match one request to an idle socket. Returning without a send closes the
/// reply slot, which the entry point reads as "no target"; running out the
/// deadline sends a typed timeout instead.
async fn dispatch_request(request: DispatchRequest, queries: &mpsc::Sender<PoolQuery>) {
    loop {
        if Instant::now() >= request.deadline {
            return send_timeout(request);
        }

        match request.target.clone() {
            Some(target) => {
                let (tx, rx) = oneshot::channel();
                let query = PoolQuery::Get { target, reply: tx };
                if queries.send(query).await.is_err() {
                    return;
                }
                let Some(pool) = rx.await.ok().flatten() else {
                    // The requested target has no pool.
                    return;
                };

                // Wait FIFO on the pool's idle queue, bounded by the
                // dispatch deadline.
                let socket = {
                    let idle = pool.idle_receiver();
                    let mut idle = idle.lock().await;
                    tokio::select! {
                        _ = tokio::time::sleep_until(request.deadline) => {
                            drop(idle);
                            return send_timeout(request);
                        }
                        socket = idle.recv() => socket,
                    }
                };
                let Some(socket) = socket else { return };

                if socket.take() {
                    return deliver(request, socket).await;
                }
                // The socket closed between queueing and take; go again.
            }
            None => {
                let (tx, rx) = oneshot::channel();
                if queries.send(PoolQuery::Snapshot { reply: tx }).await.is_err() {
                    return;
                }
                let Ok(mut pools) = rx.await else { return };
                if pools.is_empty() {
                    return;
                }

                // Non-deterministic by design: shuffle, then take the first
                // idle socket any pool can produce without blocking.
                pools.shuffle(&mut rand::thread_rng());
                let mut found = None;
                for pool in &pools {
                    let idle = pool.idle_receiver();
                    let Ok(mut idle) = idle.try_lock() else {
                        continue;
                    };
                    if let Ok(socket) = idle.try_recv() {
                        found = Some(socket);
                        break;
                    }
                }

                match found {
                    Some(socket) => {
                        if socket.take() {
                            return deliver(request, socket).await;
                        }
                        // Stale queue entry; retry right away.
                    }
                    None => tokio::time::sleep(ANY_POOL_POLL).await,
                }
            }
        }
    }
}

fn send_timeout(request: DispatchRequest) {
    let _ = request.reply.send(Err(TunnelError::Timeout {
        operation: "dispatch",
        duration_ms: request.timeout_ms,
    }));
}

async fn deliver(request: DispatchRequest, socket: Arc<TunnelSocket>) {
    if let Err(Ok(socket)) = request.reply.send(Ok(socket)) {
        // The caller went away while we searched; put the socket back.
        socket.give().await;
    }
}
