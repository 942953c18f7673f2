//! Common utilities shared across the culvert workspace.
//!
//! This crate carries the pieces every other crate needs: the error type
//! used throughout the tunnel ([`TunnelError`]) and the tracing subscriber
//! setup ([`observability::init_tracing`]).

pub mod errors;
pub mod observability;

pub use errors::{TunnelError, TunnelResult};
pub use observability::init_tracing;
