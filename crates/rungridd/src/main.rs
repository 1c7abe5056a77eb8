//! rungridd: the rungrid daemon.
//!
//! Single binary running every rungrid subsystem:
//! - State store (redb)
//! - Autoscaling decision loop
//! - Capacity reservation batching
//! - Owner sync and materialization
//! - Runner lifecycle
//! - Webhook + REST API
//!
//! # Usage
//!
//! ```text
//! rungridd --config /etc/rungrid/rungrid.toml --port 8443
//! ```

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use rungrid_core::RungridConfig;
use rungridd::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "rungridd", about = "rungrid runner autoscaling daemon")]
struct Cli {
    /// Path to rungrid.toml. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides `server.port`).
    #[arg(long)]
    port: Option<u16>,

    /// Data directory for persistent state (overrides `store.data_dir`).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rungridd=debug,rungrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = match &cli.config {
        Some(path) => RungridConfig::from_file(path)?,
        None => RungridConfig::default(),
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(dir) = cli.data_dir {
        config.store.data_dir = dir;
    }

    info!(config = ?cli.config, port = config.server.port, "rungrid daemon starting");
    let port = config.server.port;
    Context::from_config(config)?.run(port).await
}
