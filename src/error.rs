//! Error types for the runner

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Runner error type
///
/// All of these are setup or teardown failures. Session-ending I/O
/// conditions are not errors; they come back as a
/// [`RelayEnd`](crate::relay::RelayEnd).
#[derive(Error, Debug)]
pub enum Error {
    /// Pty allocation or child launch failed
    #[error(transparent)]
    Pty(#[from] runpty_pty::Error),

    #[error("failed to install signal handler: {0}")]
    Signal(#[source] nix::Error),

    #[error("failed to set descriptor flags: {0}")]
    Fcntl(#[source] nix::Error),

    #[error("failed to wait for child: {0}")]
    Wait(#[source] nix::Error),

    #[error("failed to kill child: {0}")]
    Kill(#[source] nix::Error),

    #[error("failed to open debug log {path:?}: {source}")]
    DebugLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to initialise logging: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),
}

/// Result type for runner operations
pub type Result<T> = std::result::Result<T, Error>;
