//! Logging setup
//!
//! With a debug log the runner logs to that file at `debug`; otherwise to
//! stderr at `warn`, so stderr only ever carries the runner's own
//! diagnostics. `RUST_LOG` overrides the level either way.

use std::fs::OpenOptions;
use std::io::{self, IsTerminal};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Error, Result};

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. `log` records from the pty crate are
/// bridged through it.
pub fn init(debug_log: Option<&Path>) -> Result<()> {
    match debug_log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| Error::DebugLog {
                    path: path.to_path_buf(),
                    source,
                })?;
            tracing_subscriber::registry()
                .with(filter("debug"))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .try_init()?;
        }
        None => {
            tracing_subscriber::registry()
                .with(filter("warn"))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(io::stderr().is_terminal())
                        .with_writer(io::stderr),
                )
                .try_init()?;
        }
    }
    Ok(())
}
