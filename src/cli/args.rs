//! CLI argument definitions using clap
//!
//! Commands:
//! - observe-mux replay --config <path> [--input <path>] [--log-level <level>]
//! - observe-mux kinds --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::observability::Severity;

/// observe-mux - replay a change-event script through a multiplexer
#[derive(Parser, Debug)]
#[command(name = "observe-mux")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Feed a JSON-lines script through a multiplexer and print what each handle sees
    Replay {
        /// Path to configuration file
        #[arg(long, default_value = "./observe-mux.json")]
        config: PathBuf,

        /// Script to replay (stdin when absent)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Minimum severity written to stderr
        #[arg(long, default_value = "info")]
        log_level: Severity,
    },

    /// Print the callback names accepted in the configured mode
    Kinds {
        /// Path to configuration file
        #[arg(long, default_value = "./observe-mux.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
