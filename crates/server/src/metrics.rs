//! Counter and gauge set for the tunnel server.
//!
//! The core only bumps atomics; `export_prometheus` renders the text
//! exposition served on `/metrics`. Gauges for pools and sockets are set
//! wholesale by the dispatcher's clean pass, which already walks every
//! pool.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

/// Registration outcomes tracked per label, matching the entry point's
/// failure taxonomy.
pub const REG_SUCCESS: &str = "success";
pub const REG_KEY_FAILED: &str = "keyFailed";
pub const REG_UPGRADE_FAILED: &str = "upgradeFailed";
pub const REG_GREETING_FAILED: &str = "greetingFailed";

#[derive(Debug)]
pub struct Metrics {
    started: Instant,

    // Gauges, set by the clean pass.
    pools: AtomicUsize,
    conns: AtomicUsize,
    idle: AtomicUsize,
    busy: AtomicUsize,
    /// Lifetime count of sockets closed under reaped pools.
    reaped_closed: AtomicU64,
    /// Pools bucketed by socket count, capped at [`Metrics::HISTOGRAM_CAP`].
    pools_by_conns: Mutex<BTreeMap<usize, usize>>,

    registrations: Mutex<BTreeMap<&'static str, u64>>,
    requests: AtomicU64,
    request_statuses: Mutex<BTreeMap<u16, u64>>,
}

impl Metrics {
    /// Pools with this many sockets or more share one bucket.
    pub const HISTOGRAM_CAP: usize = 11;

    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            pools: AtomicUsize::new(0),
            conns: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            reaped_closed: AtomicU64::new(0),
            pools_by_conns: Mutex::new(BTreeMap::new()),
            registrations: Mutex::new(BTreeMap::new()),
            requests: AtomicU64::new(0),
            request_statuses: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record_registration(&self, outcome: &'static str) {
        *self.registrations.lock().entry(outcome).or_default() += 1;
    }

    pub fn record_request_status(&self, code: u16) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        *self.request_statuses.lock().entry(code).or_default() += 1;
    }

    /// Replace the pool-level gauges after a clean pass.
    pub fn set_pool_gauges(
        &self,
        pools: usize,
        conns: usize,
        idle: usize,
        busy: usize,
        reaped_closed: u64,
        histogram: BTreeMap<usize, usize>,
    ) {
        self.pools.store(pools, Ordering::Relaxed);
        self.conns.store(conns, Ordering::Relaxed);
        self.idle.store(idle, Ordering::Relaxed);
        self.busy.store(busy, Ordering::Relaxed);
        self.reaped_closed.store(reaped_closed, Ordering::Relaxed);
        *self.pools_by_conns.lock() = histogram;
    }

    /// Render the Prometheus text exposition.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::with_capacity(1024);

        let gauge = |out: &mut String, name: &str, help: &str, value: u64| {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"));
        };

        gauge(&mut out, "culvert_pools", "Active connection pools", self.pools.load(Ordering::Relaxed) as u64);
        gauge(&mut out, "culvert_connections", "Tunnel sockets across all pools", self.conns.load(Ordering::Relaxed) as u64);
        gauge(&mut out, "culvert_connections_idle", "Idle tunnel sockets", self.idle.load(Ordering::Relaxed) as u64);
        gauge(&mut out, "culvert_connections_busy", "Busy tunnel sockets", self.busy.load(Ordering::Relaxed) as u64);

        out.push_str("# HELP culvert_connections_reaped_total Sockets closed under reaped pools\n");
        out.push_str("# TYPE culvert_connections_reaped_total counter\n");
        out.push_str(&format!(
            "culvert_connections_reaped_total {}\n",
            self.reaped_closed.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP culvert_pools_by_count_of_connections Pools with N sockets\n");
        out.push_str("# TYPE culvert_pools_by_count_of_connections gauge\n");
        for (bucket, count) in self.pools_by_conns.lock().iter() {
            let label = if *bucket >= Self::HISTOGRAM_CAP {
                format!("{}+", Self::HISTOGRAM_CAP)
            } else {
                bucket.to_string()
            };
            out.push_str(&format!(
                "culvert_pools_by_count_of_connections{{connections=\"{label}\"}} {count}\n"
            ));
        }

        out.push_str("# HELP culvert_registrations_total Agent registrations by outcome\n");
        out.push_str("# TYPE culvert_registrations_total counter\n");
        for (outcome, count) in self.registrations.lock().iter() {
            out.push_str(&format!(
                "culvert_registrations_total{{result=\"{outcome}\"}} {count}\n"
            ));
        }

        out.push_str("# HELP culvert_requests_total Proxied requests\n");
        out.push_str("# TYPE culvert_requests_total counter\n");
        out.push_str(&format!("culvert_requests_total {}\n", self.requests.load(Ordering::Relaxed)));

        out.push_str("# HELP culvert_request_statuses_total Proxied requests by status code\n");
        out.push_str("# TYPE culvert_request_statuses_total counter\n");
        for (code, count) in self.request_statuses.lock().iter() {
            out.push_str(&format!(
                "culvert_request_statuses_total{{code=\"{code}\"}} {count}\n"
            ));
        }

        out.push_str("# HELP culvert_uptime_seconds_total Seconds the server has been running\n");
        out.push_str("# TYPE culvert_uptime_seconds_total counter\n");
        out.push_str(&format!(
            "culvert_uptime_seconds_total {}\n",
            self.started.elapsed().as_secs()
        ));

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
