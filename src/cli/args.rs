//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Rigger - matrix build, test and release orchestration
///
/// Runs the test pipeline of a package across every cell of its build
/// matrix, and on a published release builds, retags and publishes one
/// artifact per cell.
#[derive(Parser, Debug)]
#[command(name = "rigger")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "RIGGER_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline selected by a trigger event
    Run(RunArgs),

    /// List matrix cells and the steps each would run
    Matrix(MatrixArgs),

    /// Manage the dependency cache
    Cache(CacheArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Pipeline file (defaults to the nearest rigger.toml)
    #[arg(short, long)]
    pub pipeline: Option<PathBuf>,

    /// Source revision being built
    #[arg(long, default_value = "HEAD")]
    pub revision: String,

    /// Branch or tag name
    #[arg(long, default_value = "main")]
    pub branch: String,

    /// Treat the trigger as a published release
    #[arg(long)]
    pub release: bool,

    /// Read the trigger event from a JSON file
    #[arg(long, conflicts_with_all = ["revision", "branch", "release"])]
    pub event: Option<PathBuf>,

    /// Maximum concurrently running cells
    #[arg(short = 'j', long)]
    pub max_parallel: Option<usize>,

    /// Output format for the final report
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the matrix command
#[derive(Parser, Debug)]
pub struct MatrixArgs {
    /// Pipeline file (defaults to the nearest rigger.toml)
    #[arg(short, long)]
    pub pipeline: Option<PathBuf>,

    /// Show release steps instead of test steps
    #[arg(long)]
    pub release: bool,

    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write the default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for listings and reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub action: CacheAction,
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cache entries
    List {
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Remove entries older than N days and unreferenced blobs
    Gc {
        /// Age threshold in days (default: cache.gc_days from config)
        #[arg(long)]
        days: Option<u32>,

        /// Show what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove every cache entry
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}
