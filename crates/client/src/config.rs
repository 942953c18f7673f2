//! Agent configuration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use culvert_common::TunnelResult;
use culvert_wire::{Handshake, TunneledRequest, TunneledResponse};

pub const DEFAULT_POOL_IDLE_SIZE: usize = 10;
pub const DEFAULT_POOL_MAX_SIZE: usize = 100;
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_RESET: Duration = Duration::from_secs(10);

/// Executes the requests the server tunnels down.
///
/// The default (no handler configured) executes each request with an HTTP
/// client, which requires absolute request URLs — callers reach those via
/// the server's destination-override header. A custom handler can answer
/// requests any way it likes.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        request: TunneledRequest,
        body: Bytes,
    ) -> TunnelResult<(TunneledResponse, Bytes)>;
}

/// Everything needed to run an agent.
#[derive(Clone)]
pub struct ClientConfig {
    /// Optional display name, only used in logs and server stats.
    pub name: String,
    /// Agent identifier. All of this agent's sockets pool under this id
    /// (or under a hash of it, when the server's validator issues secrets).
    pub id: String,
    /// Opaque identifiers echoed back by the server's stats endpoint.
    pub client_ids: Vec<serde_json::Value>,
    /// Register URLs of the tunnel servers to dial.
    pub targets: Vec<String>,
    /// Idle connections to maintain per target.
    pub pool_idle_size: usize,
    /// Hard cap on connections per target.
    pub pool_max_size: usize,
    /// Credential sent in the register header.
    pub secret_key: String,
    /// Connector tick: how often pools top themselves up. Floored at 1 s.
    pub clean_interval: Duration,
    /// Dial backoff step, growing per consecutive failure.
    pub backoff: Duration,
    pub max_backoff: Duration,
    /// Backoff returns to the step value after this long at max.
    pub backoff_reset: Duration,
    /// Custom request handler; `None` uses the built-in HTTP executor.
    pub handler: Option<Arc<dyn RequestHandler>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            id: String::new(),
            client_ids: Vec::new(),
            targets: vec!["ws://127.0.0.1:8080/register".to_string()],
            pool_idle_size: DEFAULT_POOL_IDLE_SIZE,
            pool_max_size: DEFAULT_POOL_MAX_SIZE,
            secret_key: String::new(),
            clean_interval: Duration::from_secs(1),
            backoff: Duration::from_millis(500),
            max_backoff: DEFAULT_MAX_BACKOFF,
            backoff_reset: DEFAULT_BACKOFF_RESET,
            handler: None,
        }
    }
}

impl ClientConfig {
    /// Clamp the knobs that must not be zero.
    pub(crate) fn normalized(mut self) -> Self {
        if self.clean_interval < Duration::from_secs(1) {
            self.clean_interval = Duration::from_secs(1);
        }
        if self.max_backoff.is_zero() {
            self.max_backoff = DEFAULT_MAX_BACKOFF;
        }
        if self.backoff_reset.is_zero() {
            self.backoff_reset = DEFAULT_BACKOFF_RESET;
        }
        if self.pool_max_size == 0 {
            self.pool_max_size = DEFAULT_POOL_MAX_SIZE;
        }
        self
    }

    /// The greeting sent on every fresh connection.
    pub(crate) fn handshake(&self) -> Handshake {
        Handshake {
            id: self.id.clone(),
            name: self.name.clone(),
            size: self.pool_idle_size,
            max_size: self.pool_max_size,
            compress: String::new(),
            client_ids: self.client_ids.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_floors_the_tick() {
        let config = ClientConfig {
            clean_interval: Duration::from_millis(10),
            pool_max_size: 0,
            ..ClientConfig::default()
        }
        .normalized();
        assert_eq!(config.clean_interval, Duration::from_secs(1));
        assert_eq!(config.pool_max_size, DEFAULT_POOL_MAX_SIZE);
    }

    #[test]
    fn handshake_mirrors_the_config() {
        let config = ClientConfig {
            id: "edge".to_string(),
            name: "Edge Agent".to_string(),
            pool_idle_size: 3,
            pool_max_size: 9,
            ..ClientConfig::default()
        };
        let handshake = config.handshake();
        assert_eq!(handshake.id, "edge");
        assert_eq!(handshake.size, 3);
        assert_eq!(handshake.max_size, 9);
        handshake.validate().unwrap();
    }
}
