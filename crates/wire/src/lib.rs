//! Wire protocol shared by the culvert tunnel server and agent client.
//!
//! A tunnel socket carries a sequence of request/response exchanges. Each
//! exchange is four frames, strictly ordered:
//!
//! 1. text: JSON [`TunneledRequest`] metadata (server → agent)
//! 2. binary: the request body (server → agent)
//! 3. text: JSON [`TunneledResponse`] metadata (agent → server)
//! 4. binary: the response body (agent → server)
//!
//! The first frame an agent ever sends, right after the upgrade, is the
//! JSON [`Handshake`] greeting. Everything in this crate is shared by both
//! ends so the two cannot drift apart.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

mod handshake;
mod request;
mod response;

pub use handshake::Handshake;
pub use request::TunneledRequest;
pub use response::TunneledResponse;

/// Header carrying the agent credential on the register call.
pub const SECRET_KEY_HEADER: &str = "x-secret-key";

/// Optional header on the request endpoint that overrides the outbound URL.
pub const DESTINATION_HEADER: &str = "x-proxy-destination";

/// Status synthesized by the server for tunnel-side failures.
pub const PROXY_ERROR_CODE: u16 = 526;

/// Status synthesized by the agent when local request execution fails.
pub const CLIENT_ERROR_CODE: u16 = 527;

/// How long either end waits for the post-upgrade greeting.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Hash a validator secret together with a declared agent id.
///
/// All sockets presenting the same credentials land in the same pool, and
/// an agent cannot collide with another pool without knowing its secret.
pub fn hash_key_id(secret: &str, id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(id.as_bytes());
    hex::encode(hasher.finalize())
}

/// The canonical identifier a pool is keyed by.
///
/// Either the agent's declared id verbatim (no validator secret), or the
/// hex SHA-256 of `secret || id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolKey(String);

impl PoolKey {
    /// Wrap an id that is already canonical.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Compute the canonical key for a declared id and validator secret.
    pub fn canonical(secret: &str, id: &str) -> Self {
        if secret.is_empty() {
            Self(id.to_string())
        } else {
            Self(hash_key_id(secret, id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Convert an `http::HeaderMap` into the wire multi-map form.
pub fn headers_to_wire(headers: &http::HeaderMap) -> std::collections::HashMap<String, Vec<String>> {
    let mut map: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}
