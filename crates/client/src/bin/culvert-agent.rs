//! culvert-agent - a minimal agent that tunnels requests to the local web.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use culvert_client::{Client, ClientConfig};

/// Dial a culvert tunnel server and execute the requests it relays.
#[derive(Parser, Debug)]
#[command(name = "culvert-agent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Agent id; sockets pool under this on the server.
    #[arg(long, env = "CULVERT_ID")]
    id: String,

    /// Display name for logs and server stats.
    #[arg(long, default_value = "")]
    name: String,

    /// Register URL(s) of the tunnel server(s).
    #[arg(long = "target", default_value = "ws://127.0.0.1:8080/register")]
    targets: Vec<String>,

    /// Credential for the register endpoint.
    #[arg(long, env = "CULVERT_SECRET", default_value = "")]
    secret: String,

    /// Idle connections to maintain per target.
    #[arg(long, default_value_t = 10)]
    pool_idle_size: usize,

    /// Hard cap on connections per target.
    #[arg(long, default_value_t = 100)]
    pool_max_size: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    culvert_common::init_tracing().context("installing tracing subscriber")?;

    let mut client = Client::new(ClientConfig {
        id: cli.id,
        name: cli.name,
        targets: cli.targets,
        secret_key: cli.secret,
        pool_idle_size: cli.pool_idle_size,
        pool_max_size: cli.pool_max_size,
        ..ClientConfig::default()
    });

    client.start();

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    client.shutdown();
    Ok(())
}
