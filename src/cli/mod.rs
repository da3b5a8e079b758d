//! CLI module for observe-mux
//!
//! Provides command-line interface for:
//! - replay: Run a JSON-lines script through a multiplexer
//! - kinds: List the callbacks a configured multiplexer accepts

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{kinds, replay, run, run_command, run_script, OutputSink};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{parse_script, read_script, write_line, write_response, ScriptLine};
