//! streamslice standalone driver

mod config;
mod workload;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;

/// streamslice - sliced window aggregation and join over pooled buffers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "STREAMSLICE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Worker threads, overriding the configuration file
    #[arg(long)]
    workers: Option<usize>,

    /// Pooled buffers, overriding the configuration file
    #[arg(long)]
    buffers: Option<usize>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "streamslice_server={0},streamslice_core={0}",
                    args.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting streamslice");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(path) = &args.config {
        info!("Config file: {}", path.display());
    }
    if let Some(workers) = args.workers {
        config.workload.workers = workers;
    }
    if let Some(buffers) = args.buffers {
        config.pool.num_buffers = buffers;
    }

    let report = workload::run(&config)?;
    info!("{report}");
    Ok(())
}
