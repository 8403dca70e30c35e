// File: snapkeep/src/main.rs
use clap::Parser;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

use snapkeep::config::Config;
use snapkeep::constants::{DEFAULT_CONFIG_PATH, DEFAULT_LOCKFILE};
use snapkeep::{policy, SnapkeepError};

/// Automatic snapshotting and replication for ZFS on Linux.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Policy to execute
    #[arg(long)]
    policy: String,

    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override path to lockfile
    #[arg(long, value_name = "PATH")]
    lockfile: Option<PathBuf>,

    /// Remove all policy snapshots or reinitialize replication
    #[arg(long)]
    reset: bool,

    /// Log level for console output
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Suppress output from the run
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if !args.quiet {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("snapkeep={}", args.log_level)));
        fmt().with_env_filter(filter).init();
    }

    let code = match run(args).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> snapkeep::Result<()> {
    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = Config::load(&config_path).await?;
    let lockfile = args
        .lockfile
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCKFILE));

    tokio::select! {
        result = policy::run(&config, &args.policy, &lockfile, args.reset) => result,
        _ = tokio::signal::ctrl_c() => Err(SnapkeepError::Interrupted),
    }
}
