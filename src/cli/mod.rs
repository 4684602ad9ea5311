mod app;

pub use app::*;

use std::path::PathBuf;

use clap::Parser;

use crate::Commands;

/// Main CLI application arguments and command structure
#[derive(Parser)]
#[clap(
    version,
    about = "Multi-user markdown note storage with share links and backups"
)]
pub struct Cli {
    /// Path to the configuration file
    #[clap(short = 'c', long, value_parser)]
    pub config: Option<PathBuf>,

    /// Root directory for all stored data
    #[clap(long, value_parser)]
    pub data_dir: Option<PathBuf>,

    /// Path to the backup directory
    #[clap(long, value_parser)]
    pub backup_dir: Option<PathBuf>,

    /// Verbose output mode
    #[clap(short, long)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Commands,
}
