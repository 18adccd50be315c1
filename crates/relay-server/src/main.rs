//! relay-server binary entry point.

use clap::Parser;
use relay_server::config::ServerConfig;
use relay_server::server::RelayServer;
use std::path::PathBuf;
use tracing::{error, info};

/// relay-server — edgetun edge relay
#[derive(Parser, Debug)]
#[command(name = "relay-server", version, about = "edgetun edge relay")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.edgetun/config.toml")]
    config: String,

    /// Point-of-presence code reported by the hosting environment
    #[arg(long)]
    pop: Option<String>,

    /// Remote config source URL
    #[arg(long)]
    upstream: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(
        Some(&config_path),
        cli.port,
        cli.pop.as_deref(),
        cli.upstream.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        pop = %config.pop,
        "starting relay-server"
    );

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}
