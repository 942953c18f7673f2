//! Per-target connection pool on the agent side.
//!
//! Each target URL gets one pool. A one-second connector tick (plus an
//! immediate nudge whenever a connection goes busy) tops the pool up to the
//! configured idle size, never exceeding the max. Dial failures back off
//! per target.

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::connection;

/// Connection states, mirrored into an atomic so the connector can count
/// without locking every handle.
pub(crate) const CONNECTING: u8 = 0;
pub(crate) const IDLE: u8 = 1;
pub(crate) const RUNNING: u8 = 2;

#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    pub id: String,
    pub status: Arc<AtomicU8>,
    pub cancel: CancellationToken,
}

impl ConnectionHandle {
    fn new(parent: &CancellationToken) -> Self {
        // A short random tag, purely for log correlation.
        let id = rand::thread_rng().gen_range(100..=999).to_string();
        Self {
            id,
            status: Arc::new(AtomicU8::new(CONNECTING)),
            cancel: parent.child_token(),
        }
    }

    pub fn set_status(&self, status: u8) {
        self.status.store(status, Ordering::Relaxed);
    }
}

pub(crate) struct PoolShared {
    pub config: Arc<ClientConfig>,
    pub target: String,
    pub http: reqwest::Client,
    connections: Mutex<Vec<ConnectionHandle>>,
    topup: Notify,
    pub cancel: CancellationToken,
    consecutive_failures: AtomicU32,
    last_attempt: Mutex<Option<Instant>>,
}

impl PoolShared {
    fn new(config: Arc<ClientConfig>, target: String, cancel: CancellationToken) -> Self {
        Self {
            config,
            target,
            http: reqwest::Client::new(),
            connections: Mutex::new(Vec::new()),
            topup: Notify::new(),
            cancel,
            consecutive_failures: AtomicU32::new(0),
            last_attempt: Mutex::new(None),
        }
    }

    /// Ask the connector to run soon; called when a connection goes busy
    /// so a replacement is dialing while the request runs.
    pub fn request_topup(&self) {
        self.topup.notify_one();
    }

    pub fn note_dial_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn note_dial_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove(&self, id: &str) {
        self.connections.lock().retain(|handle| handle.id != id);
    }

    fn count(&self) -> (usize, usize) {
        let connections = self.connections.lock();
        let idle = connections
            .iter()
            .filter(|handle| handle.status.load(Ordering::Relaxed) == IDLE)
            .count();
        (idle, connections.len())
    }

    /// Current dial backoff, derived from consecutive failures and capped.
    /// After sitting at the cap past `backoff_reset`, drop back to a single
    /// step so recovery is probed again.
    fn backoff_delay(&self) -> Duration {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures == 0 {
            return Duration::ZERO;
        }
        let delay = self.config.backoff.saturating_mul(failures);
        if delay > self.config.max_backoff {
            let at_max_for = self.config.backoff.saturating_mul(
                failures.saturating_sub(
                    (self.config.max_backoff.as_millis()
                        / self.config.backoff.as_millis().max(1)) as u32,
                ),
            );
            if at_max_for > self.config.backoff_reset {
                self.consecutive_failures.store(1, Ordering::Relaxed);
                return self.config.backoff;
            }
            return self.config.max_backoff;
        }
        delay
    }

    fn may_attempt(&self) -> bool {
        let delay = self.backoff_delay();
        if delay.is_zero() {
            return true;
        }
        let last = self.last_attempt.lock();
        match *last {
            Some(at) => at.elapsed() >= delay,
            None => true,
        }
    }

    /// Top the pool up toward the configured idle size.
    fn connector(self: &Arc<Self>) {
        if self.cancel.is_cancelled() || !self.may_attempt() {
            return;
        }

        let (idle, total) = self.count();
        let mut to_create = self.config.pool_idle_size.saturating_sub(idle);
        if total == 0 {
            // Probe with a single connection before committing the fleet.
            to_create = 1;
        }
        to_create = to_create.min(self.config.pool_max_size.saturating_sub(total));

        if to_create == 0 {
            return;
        }

        debug!(target = %self.target, to_create, idle, total, "topping up tunnel pool");
        *self.last_attempt.lock() = Some(Instant::now());

        for _ in 0..to_create {
            self.spawn_connection();
        }
    }

    fn spawn_connection(self: &Arc<Self>) {
        let handle = ConnectionHandle::new(&self.cancel);
        self.connections.lock().push(handle.clone());

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            match connection::run(Arc::clone(&shared), handle.clone()).await {
                Ok(()) => {}
                Err(err) => {
                    if !shared.cancel.is_cancelled() {
                        warn!(
                            target = %shared.target,
                            conn = %handle.id,
                            error = %err,
                            "tunnel connection ended",
                        );
                    }
                    shared.note_dial_failure();
                }
            }
            shared.remove(&handle.id);
        });
    }
}

/// One running pool; dropping the client cancels it.
pub(crate) struct ClientPool {
    shared: Arc<PoolShared>,
}

impl ClientPool {
    pub fn start(config: Arc<ClientConfig>, target: String, cancel: CancellationToken) -> Self {
        let shared = Arc::new(PoolShared::new(config, target, cancel));

        let runner = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(runner.config.clean_interval);
            loop {
                tokio::select! {
                    _ = runner.cancel.cancelled() => break,
                    _ = tick.tick() => {}
                    _ = runner.topup.notified() => {}
                }
                runner.connector();
            }

            for handle in runner.connections.lock().iter() {
                handle.cancel.cancel();
            }
        });

        Self { shared }
    }

    pub fn target(&self) -> &str {
        &self.shared.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(config: ClientConfig) -> Arc<PoolShared> {
        Arc::new(PoolShared::new(
            Arc::new(config.normalized()),
            "ws://127.0.0.1:1/register".to_string(),
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn backoff_grows_with_failures_and_resets() {
        let pool = shared(ClientConfig {
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            ..ClientConfig::default()
        });

        assert_eq!(pool.backoff_delay(), Duration::ZERO);

        pool.note_dial_failure();
        assert_eq!(pool.backoff_delay(), Duration::from_millis(100));
        pool.note_dial_failure();
        assert_eq!(pool.backoff_delay(), Duration::from_millis(200));
        pool.note_dial_failure();
        pool.note_dial_failure();
        assert_eq!(pool.backoff_delay(), Duration::from_millis(300));

        pool.note_dial_success();
        assert_eq!(pool.backoff_delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn may_attempt_waits_out_the_backoff() {
        let pool = shared(ClientConfig {
            backoff: Duration::from_secs(5),
            ..ClientConfig::default()
        });

        assert!(pool.may_attempt());
        *pool.last_attempt.lock() = Some(Instant::now());
        pool.note_dial_failure();
        assert!(!pool.may_attempt());
    }
}
