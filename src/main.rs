//! Rigger CLI entry point

use clap::Parser;
use console::style;
use rigger::cli::{Cli, Commands};
use rigger::config::{Config, ConfigManager};
use rigger::error::RiggerResult;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> RiggerResult<()> {
    let cli = Cli::parse();

    let manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = manager.load().await?;

    init_logging(cli.verbose, &config);

    match cli.command {
        Commands::Run(args) => rigger::cli::commands::run(args, &config).await,
        Commands::Matrix(args) => rigger::cli::commands::matrix(args).await,
        Commands::Cache(args) => rigger::cli::commands::cache(args, &config).await,
        Commands::Config(args) => rigger::cli::commands::config(args, &manager, &config).await,
    }
}

/// 0 = warn, 1 = info, 2+ = debug; `RUST_LOG` wins when set
fn init_logging(verbose: u8, config: &Config) {
    let default = match verbose {
        0 => "rigger=warn",
        1 => "rigger=info",
        _ => "rigger=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
