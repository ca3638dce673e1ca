//! Error types for pty allocation and child launch

use thiserror::Error;

/// Setup failure while allocating a pty or launching the child.
///
/// Every variant is fatal to the runner: these all point at the host
/// environment, so nothing here is retried.
#[derive(Error, Debug)]
pub enum Error {
    /// `posix_openpt`/`openpty` failed (usually pty exhaustion or permissions)
    #[error("failed to open pty: {0}")]
    OpenMaster(#[source] nix::Error),

    #[error("failed to grant pty access: {0}")]
    Grant(#[source] nix::Error),

    #[error("failed to unlock pty: {0}")]
    Unlock(#[source] nix::Error),

    #[error("failed to get slave pty name: {0}")]
    SlaveName(#[source] nix::Error),

    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("child failed to setsid(): {0}")]
    Setsid(#[source] nix::Error),

    #[error("open slave pty in child failed: {0}")]
    OpenSlave(#[source] nix::Error),

    #[error("failed to push STREAMS module '{module}': {source}")]
    PushModule {
        module: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("TIOCSCTTY failed in child: {0}")]
    ControllingTerminal(#[source] nix::Error),

    #[error("failed to redirect standard streams: {0}")]
    Dup2(#[source] nix::Error),

    #[error("exec in child failed: {0}")]
    Exec(#[source] nix::Error),

    /// Program name or argument contains an interior NUL byte
    #[error("invalid argument {0:?}: contains a NUL byte")]
    InvalidArgument(String),

    #[error("failed to set window size: {0}")]
    WindowSize(#[source] nix::Error),

    #[error("failed to set descriptor flags: {0}")]
    Fcntl(#[source] nix::Error),
}

/// Result type for pty operations
pub type Result<T> = std::result::Result<T, Error>;
