//! The main entrypoint for abupdate, a thin wrapper around the lib crate
//! which does most of the work.

use std::io::Write as _;

use anyhow::Result;
use owo_colors::OwoColorize;

fn run() -> Result<()> {
    abupdate_utils::initialize_tracing();
    tracing::trace!("starting");
    abupdate_lib::cli::run_from_iter(std::env::args())
}

fn main() {
    if let Err(e) = run() {
        let mut stderr = anstream::stderr();
        // Don't panic if writing fails
        let _ = writeln!(stderr, "{}{:#}", "error: ".red(), e);
        std::process::exit(1);
    }
}
