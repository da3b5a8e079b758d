//! observe-mux entry point
//!
//! Parses arguments and dispatches via `cli::run`. Errors go to stderr
//! as `CODE: message` and the process exits non-zero.

use observe_multiplex::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
