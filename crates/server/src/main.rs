//! culvertd - the culvert tunnel server binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use culvert_server::{App, ServerConfig};

/// Reverse HTTP tunnel server. Agents dial in; callers are proxied down an
/// idle tunnel to the agent that executes the request locally.
#[derive(Parser, Debug)]
#[command(name = "culvertd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (TOML).
    #[arg(short = 'c', long = "config", env = "CULVERT_CONFIG")]
    config: Option<String>,

    /// Enable debug logging.
    #[arg(long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration file and exit.
    Test {
        #[arg(short = 'c', long = "config")]
        config: Option<String>,
    },
    /// Run the server (the default).
    Run {
        #[arg(short = 'c', long = "config")]
        config: Option<String>,
    },
}

fn load_config(path: Option<&str>) -> Result<ServerConfig> {
    match path {
        Some(path) => {
            ServerConfig::from_file(path).with_context(|| format!("loading config from {path}"))
        }
        None => Ok(ServerConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    culvert_common::init_tracing().context("installing tracing subscriber")?;

    match cli.command {
        Some(Commands::Test { config }) => {
            let path = config.or(cli.config);
            let config = load_config(path.as_deref())?;
            info!(
                addr = %config.listen_addr()?,
                dispatchers = config.dispatchers,
                "configuration is valid",
            );
            Ok(())
        }
        Some(Commands::Run { config }) => serve(config.or(cli.config)).await,
        None => serve(cli.config).await,
    }
}

async fn serve(path: Option<String>) -> Result<()> {
    let config = load_config(path.as_deref())?;
    print_config(&config);

    let app = App::bind(config).await.context("binding tunnel server")?;

    app.run_until(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await
    .context("running tunnel server")?;

    Ok(())
}

fn print_config(config: &ServerConfig) {
    info!(pid = std::process::id(), "culvertd starting");
    info!(host = %config.host, port = config.port, "listen address");
    info!(dispatchers = config.dispatchers, timeout_ms = config.timeout_ms, "dispatch");
    info!(
        idle_timeout_s = config.idle_timeout_secs,
        idle_buffer_multiple = config.idle_buffer_multiple,
        "pool lifecycle",
    );
    info!(upstreams = ?config.upstreams, "allowed requestors");
    info!(id_header = ?config.id_header, "target selection");
}
