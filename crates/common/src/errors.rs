//! Error types for the culvert tunnel.
//!
//! One error enum covers both ends of the tunnel. Variants map onto the
//! failure modes a caller can observe: credential rejection, protocol
//! violations, transport failures, and dispatch misses. Server entry points
//! translate these into the tunnel-specific HTTP status codes.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Main error type for tunnel operations.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The register call carried a missing or unacceptable credential.
    #[error("provided key is not authorized")]
    InvalidKey,

    /// The configured client id header was absent from the request.
    #[error("required client id header is missing: {0}")]
    MissingClientId(String),

    /// No pool exists for the requested target id.
    #[error("no proxy target found for request: {0}")]
    NoProxyTarget(String),

    /// A request arrived while no agent is connected at all.
    #[error("no proxy target found for request: no pools registered")]
    NoPools,

    /// A peer sent something the protocol does not allow at this point.
    #[error("invalid data received: {0}")]
    InvalidData(String),

    /// The greeting after upgrade could not be read or parsed.
    #[error("greeting failure: {0}")]
    Greeting(String),

    /// Reading or writing a frame on the tunnel socket failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Wire metadata could not be serialized or parsed.
    #[error("serializing tunnel message: {0}")]
    Serialize(#[from] serde_json::Error),

    /// An operation did not finish within its deadline.
    #[error("{operation} timed out after {duration_ms}ms")]
    Timeout {
        operation: &'static str,
        duration_ms: u64,
    },

    /// The external HTTP caller disconnected while we waited on the agent.
    #[error("http client gave up waiting for remote")]
    CallerGone,

    /// The socket was closed while an operation was in flight.
    #[error("connection is closed: {0}")]
    Closed(String),

    /// Listener or socket level I/O failure.
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),

    /// Subscriber installation failed (double init, bad filter).
    #[error("telemetry setup failed: {0}")]
    Telemetry(String),
}

impl TunnelError {
    /// True when the error is worth tearing the socket down for.
    ///
    /// Dispatch misses (no pool, no target header, no idle socket within
    /// the deadline) never held a socket; every other failure happens with
    /// a socket in hand and closes it.
    pub fn closes_socket(&self) -> bool {
        !matches!(
            self,
            TunnelError::NoProxyTarget(_)
                | TunnelError::NoPools
                | TunnelError::MissingClientId(_)
                | TunnelError::Timeout { .. }
        )
    }
}
