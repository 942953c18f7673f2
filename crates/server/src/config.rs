//! Server configuration.
//!
//! Loaded from a TOML file by the binary, or built in code by embedders and
//! tests. Every field has a default so a bare `[server]` table runs.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use serde::{Deserialize, Serialize};

use culvert_common::{TunnelError, TunnelResult};
use culvert_wire::SECRET_KEY_HEADER;

/// Knobs for the tunnel server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// How long a dispatch may wait for an idle socket.
    pub timeout_ms: u64,
    /// Idle sockets beyond an agent's declared size are evicted after this.
    pub idle_timeout_secs: u64,
    /// Shared secret for the built-in credential check.
    pub secret_key: String,
    /// When set, requests must carry this header naming the target agent.
    /// When empty, requests go to any agent with an idle socket.
    pub id_header: Option<String>,
    /// Dispatch worker count.
    pub dispatchers: usize,
    /// Idle queue capacity as a multiple of the handshake `max`, to ride
    /// out reconnect storms without tripping the overflow policy.
    pub idle_buffer_multiple: usize,
    /// IPs or CIDRs allowed to call the request, stats and metrics
    /// endpoints. Empty means nobody.
    pub upstreams: Vec<String>,
    /// Upper bound on a single request or response body.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            timeout_ms: 1_000,
            idle_timeout_secs: 61,
            secret_key: String::new(),
            id_header: None,
            dispatchers: 1,
            idle_buffer_multiple: 3,
            upstreams: Vec::new(),
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Parse a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> TunnelResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&raw)
            .map_err(|err| TunnelError::InvalidData(format!("parsing config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TunnelResult<()> {
        if self.dispatchers == 0 {
            return Err(TunnelError::InvalidData(
                "dispatchers must be at least 1".to_string(),
            ));
        }
        if self.idle_buffer_multiple == 0 {
            return Err(TunnelError::InvalidData(
                "idle_buffer_multiple must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(TunnelError::InvalidData(
                "timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn listen_addr(&self) -> TunnelResult<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|err| TunnelError::InvalidData(format!("bad listen address: {err}")))
    }
}

/// Pluggable credential check for the register endpoint.
///
/// Returns the validator's secret on success. A non-empty secret is hashed
/// together with the agent's declared id to form the pool key, so agents
/// can pick their own ids without being able to collide with anyone else's
/// pool.
#[async_trait]
pub trait KeyValidator: Send + Sync {
    async fn validate(&self, headers: &HeaderMap) -> TunnelResult<String>;
}

/// Built-in validator: plain equality against the configured secret key.
/// Never returns a secret, so pool keys stay the declared agent ids.
pub struct SecretKeyValidator {
    secret_key: String,
}

impl SecretKeyValidator {
    pub fn new(secret_key: String) -> Self {
        Self { secret_key }
    }
}

#[async_trait]
impl KeyValidator for SecretKeyValidator {
    async fn validate(&self, headers: &HeaderMap) -> TunnelResult<String> {
        let presented = headers
            .get(SECRET_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        if presented != self.secret_key {
            return Err(TunnelError::InvalidKey);
        }

        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(1));
        assert_eq!(config.idle_timeout(), Duration::from_secs(61));
        assert_eq!(config.dispatchers, 1);
        config.validate().unwrap();
    }

    #[test]
    fn toml_round_trip() {
        let raw = r#"
            host = "0.0.0.0"
            port = 9090
            timeout_ms = 250
            secret_key = "hunter2"
            id_header = "X-Target"
            upstreams = ["127.0.0.1", "10.0.0.0/8"]
        "#;
        let config: ServerConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.timeout(), Duration::from_millis(250));
        assert_eq!(config.id_header.as_deref(), Some("X-Target"));
        assert_eq!(config.upstreams.len(), 2);
        // Unlisted fields keep their defaults.
        assert_eq!(config.idle_buffer_multiple, 3);
    }

    #[test]
    fn zero_dispatchers_is_rejected() {
        let config = ServerConfig {
            dispatchers: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn secret_key_validator_checks_equality() {
        let validator = SecretKeyValidator::new("hunter2".to_string());

        let mut headers = HeaderMap::new();
        headers.insert(SECRET_KEY_HEADER, "hunter2".parse().unwrap());
        assert_eq!(validator.validate(&headers).await.unwrap(), "");

        headers.insert(SECRET_KEY_HEADER, "wrong".parse().unwrap());
        assert!(validator.validate(&headers).await.is_err());

        assert!(validator.validate(&HeaderMap::new()).await.is_err());
    }
}
