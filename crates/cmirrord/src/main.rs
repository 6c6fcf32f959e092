//! cmirrord: cloudmirror placeholder daemon
//!
//! Usage:
//!   cmirrord [--config /etc/cloudmirror/config.toml] [run]
//!   cmirrord [--config ...] hydrate <path>
//!
//! Commands:
//!   run      - Connect the sync root and serve hydration until SIGTERM/SIGINT [default]
//!   hydrate  - Hydrate one placeholder in full and exit (root must not be connected elsewhere)

mod daemon;
mod metrics;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use cmirror_core::config::MirrorConfig;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cmirrord", version, about = "cloudmirror placeholder daemon")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(
        long,
        short = 'c',
        env = "CMIRROR_CONFIG",
        default_value = "/etc/cloudmirror/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CMIRROR_LOG")]
    log: Option<String>,

    /// Log format (json, text)
    #[arg(long, env = "CMIRROR_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default)
    Run,
    /// Hydrate one placeholder in full, then exit
    Hydrate {
        /// Placeholder path, absolute or relative to the sync root
        path: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The config is read before logging exists, so a missing file is
    // reported once the subscriber is up.
    let loaded = load_config(&cli.config).await?;
    let missing = loaded.is_none();
    let config = loaded.unwrap_or_default();

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = cli
        .log_format
        .or_else(|| LogFormat::from_str(&config.daemon.log_format, true).ok())
        .unwrap_or(LogFormat::Text);
    init_logging(&level, format);

    if missing {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "cmirrord starting"
    );

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => daemon::run(config).await,
        Command::Hydrate { path } => daemon::hydrate(config, path).await,
    }
}

/// `None` when the file does not exist.
async fn load_config(path: &Path) -> Result<Option<MirrorConfig>> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        MirrorConfig::from_file(path).map(Some)
    } else {
        Ok(None)
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
