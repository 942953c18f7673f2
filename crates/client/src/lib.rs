//! Agent-side library for the culvert reverse HTTP tunnel.
//!
//! An agent dials out to one or more tunnel servers, keeps a pool of idle
//! websocket connections registered with each, and executes the HTTP
//! requests the server relays down those connections. Nothing here listens
//! for inbound traffic; the agent only ever dials.
//!
//! ```no_run
//! use culvert_client::{Client, ClientConfig};
//!
//! # async fn run() {
//! let mut client = Client::new(ClientConfig {
//!     id: "edge-7".to_string(),
//!     targets: vec!["ws://tunnel.example.com/register".to_string()],
//!     secret_key: "hunter2".to_string(),
//!     ..ClientConfig::default()
//! });
//! client.start();
//! # }
//! ```

pub mod client;
pub mod config;
mod connection;
mod pool;

pub use client::Client;
pub use config::{ClientConfig, RequestHandler};
