//! runpty
//!
//! `runpty [--debug-log FILE] [--no-winsize] <program> [args...]`
//!
//! Exits with the child's own exit code when it exits normally, 1 when it
//! is killed by a signal or setup fails, and 2 without output when no
//! program is given.

use std::process::ExitCode;

use runpty::config::{Config, ParseOutcome};

fn main() -> ExitCode {
    let config = match Config::from_env() {
        ParseOutcome::Run(config) => config,
        ParseOutcome::MissingProgram => return ExitCode::from(2),
        ParseOutcome::Clap(e) => e.exit(),
    };

    if let Err(e) = runpty::logging::init(config.debug_log.as_deref()) {
        eprintln!("runpty: {}", e);
    }

    match runpty::run(&config) {
        Ok(exit) => {
            if let Some(line) = exit.report() {
                eprintln!("{}", line);
            }
            ExitCode::from(exit.exit_code())
        }
        Err(e) => {
            tracing::debug!("fatal: {}", e);
            eprintln!("\nrunpty: {}", e);
            ExitCode::FAILURE
        }
    }
}
