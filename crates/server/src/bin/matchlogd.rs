//! The matchlog server daemon.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use eyre::{Result as EyreResult, WrapErr};
use matchlog_server::config::ServerConfig;
use matchlog_store::Store;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "matchlogd", about = "Incident-log sync server")]
struct Args {
    /// Path to a TOML config file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listen address, overriding the config file.
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> EyreResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<ServerConfig>(&raw)
                .wrap_err_with(|| format!("failed to parse {}", path.display()))?
        }
        None => ServerConfig::default(),
    };

    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    matchlog_server::start(config, Store::memory()).await
}
