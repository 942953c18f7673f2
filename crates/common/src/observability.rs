//! Tracing setup for culvert binaries.
//!
//! Structured logging with a JSON layer in production and a human-readable
//! layer for development, switched by `CULVERT_LOG_FORMAT`. The filter comes
//! from `RUST_LOG` and defaults to `info`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::{TunnelError, TunnelResult};

/// Install the global tracing subscriber.
///
/// `CULVERT_LOG_FORMAT=json` (the default) emits one JSON object per line;
/// `pretty` emits the multi-line development format; anything else falls
/// back to the compact single-line format.
pub fn init_tracing() -> TunnelResult<()> {
    let format = std::env::var("CULVERT_LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let json_layer = if format == "json" {
        Some(fmt::layer().json().with_target(true).with_thread_ids(true))
    } else {
        None
    };

    let pretty_layer = if format == "pretty" {
        Some(fmt::layer().pretty().with_target(true))
    } else {
        None
    };

    let compact_layer = if format != "json" && format != "pretty" {
        Some(fmt::layer().compact().with_target(false))
    } else {
        None
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .with(compact_layer)
        .try_init()
        .map_err(|err| TunnelError::Telemetry(err.to_string()))
}
