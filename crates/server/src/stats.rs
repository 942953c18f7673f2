//! JSON shapes served by the stats endpoint.

use std::collections::BTreeMap;

use serde::Serialize;

use culvert_wire::Handshake;

use crate::pool::{PoolHandle, PoolSize};

/// Top-level stats document: per-pool aggregates plus per-worker dispatch
/// counts.
#[derive(Debug, Default, Serialize)]
pub struct ServerStats {
    pub pools: BTreeMap<String, PoolStatsEntry>,
    pub threads: BTreeMap<String, u64>,
}

/// One pool's slice of the stats document.
#[derive(Debug, Serialize)]
pub struct PoolStatsEntry {
    /// When the pool was created, RFC 3339.
    pub connected: String,
    /// Seconds since the pool was created.
    pub duration: u64,
    /// Sockets currently parked in the idle queue.
    #[serde(rename = "idlePoolWait")]
    pub idle_pool_wait: usize,
    /// Idle queue capacity.
    #[serde(rename = "idlePoolSize")]
    pub idle_pool_size: usize,
    /// The agent's greeting, echoed back.
    pub client: Handshake,
    pub sizes: PoolSize,
}

impl PoolStatsEntry {
    pub fn new(pool: &PoolHandle, size: PoolSize) -> Self {
        let connected = pool.connected_at();
        let duration = (chrono::Utc::now() - connected).num_seconds().max(0) as u64;

        Self {
            connected: connected.to_rfc3339(),
            duration,
            idle_pool_wait: size.queue_len,
            idle_pool_size: size.queue_capacity,
            client: size.handshake.clone(),
            sizes: size,
        }
    }
}
