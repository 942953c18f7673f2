//! Reverse HTTP tunnel server.
//!
//! Agents dial in over websockets and pool their connections per agent id;
//! external HTTP callers submit requests that the dispatcher matches to an
//! idle tunnel socket, where a single request/response exchange runs with
//! the body frames relayed straight through. The server never dials the
//! agents.
//!
//! ```no_run
//! use culvert_server::{App, ServerConfig};
//!
//! # async fn run() -> culvert_common::TunnelResult<()> {
//! let config = ServerConfig {
//!     upstreams: vec!["10.0.0.0/8".to_string()],
//!     ..ServerConfig::default()
//! };
//! App::bind(config).await?.run().await
//! # }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use culvert_common::TunnelResult;

pub mod allowlist;
pub mod config;
pub mod dispatch;
pub mod exchange;
pub mod handlers;
pub mod metrics;
pub mod pool;
pub mod socket;
pub mod stats;
pub mod transport;

pub use config::{KeyValidator, SecretKeyValidator, ServerConfig};
pub use dispatch::TunnelServer;
pub use metrics::Metrics;

/// A bound tunnel server, ready to run.
pub struct App {
    state: handlers::AppState,
    server: TunnelServer,
    listener: tokio::net::TcpListener,
}

impl App {
    /// Bind the listener and start the dispatcher with the built-in
    /// secret-key credential check.
    pub async fn bind(config: ServerConfig) -> TunnelResult<Self> {
        let validator: Arc<dyn KeyValidator> =
            Arc::new(SecretKeyValidator::new(config.secret_key.clone()));
        Self::bind_with_validator(config, validator).await
    }

    /// Bind with a custom credential validator. A validator that returns a
    /// non-empty secret makes pool keys the hash of `secret || id`.
    pub async fn bind_with_validator(
        config: ServerConfig,
        validator: Arc<dyn KeyValidator>,
    ) -> TunnelResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let metrics = Arc::new(Metrics::new());
        let server = TunnelServer::start(Arc::clone(&config), Arc::clone(&metrics));
        let state = handlers::AppState::new(
            Arc::clone(&config),
            server.clone(),
            metrics,
            validator,
        );

        let listener = tokio::net::TcpListener::bind(config.listen_addr()?).await?;
        info!(addr = %listener.local_addr()?, "culvert listening");

        Ok(Self {
            state,
            server,
            listener,
        })
    }

    pub fn local_addr(&self) -> TunnelResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle to the dispatcher, mainly for shutdown and stats.
    pub fn server(&self) -> TunnelServer {
        self.server.clone()
    }

    /// Serve until the process dies.
    pub async fn run(self) -> TunnelResult<()> {
        let router = handlers::router(self.state);
        axum::serve(
            self.listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }

    /// Serve until `shutdown` resolves, then cascade the shutdown through
    /// the dispatcher and every pool.
    pub async fn run_until(self, shutdown: impl Future<Output = ()> + Send + 'static) -> TunnelResult<()> {
        let server = self.server.clone();
        let router = handlers::router(self.state);

        axum::serve(
            self.listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;

        server.shutdown();
        Ok(())
    }
}
