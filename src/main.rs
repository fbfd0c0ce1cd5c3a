//! Convoy - concurrent task fan-out for configuration management
//!
//! This is the main entry point for the Convoy CLI.

mod cli;

use anyhow::{Context, Result};
use cli::{Cli, Commands};
use convoy::config::Config;
use convoy::routing::Router;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(cli.verbosity());

    let exit_code = match &cli.command {
        Commands::Run(args) => {
            let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
            args.execute(config).await?
        }
        Commands::ValidateRouting(args) => validate_routing(&args.file)?,
    };

    std::process::exit(exit_code);
}

/// Initialize logging based on verbosity level
fn init_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(verbosity >= 3))
        .with(env_filter)
        .init();
}

/// Load a routing table and report redirect cycles
fn validate_routing(path: &std::path::Path) -> Result<i32> {
    let router = Router::new();
    router
        .load_config_from_file(path)
        .with_context(|| format!("Failed to load routing file: {}", path.display()))?;

    match router.validate_config() {
        Ok(()) => {
            println!("{}: ok", path.display());
            Ok(0)
        }
        Err(e) => {
            eprintln!("{}: {}", path.display(), e);
            Ok(1)
        }
    }
}
