//! Signal plumbing
//!
//! Handlers only bump an atomic counter. Every decision based on those
//! counters is taken in the main loop, at the points where it waits.

use std::sync::atomic::{AtomicUsize, Ordering};

use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::{Error, Result};

/// Process-wide quit request counter
///
/// Raised by SIGINT/SIGTERM, polled cooperatively by the relay.
#[derive(Debug)]
pub struct QuitFlag(AtomicUsize);

impl QuitFlag {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub fn raise(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.count() > 0
    }

    /// Number of quit requests received so far
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for QuitFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// The flag the installed signal handlers raise
pub static QUIT: QuitFlag = QuitFlag::new();

static CHILD_EXITS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_quit(_: libc::c_int) {
    QUIT.raise();
}

extern "C" fn on_child_exit(_: libc::c_int) {
    CHILD_EXITS.fetch_add(1, Ordering::SeqCst);
}

/// Install the handlers the relay depends on
///
/// SIGINT and SIGTERM raise [`QUIT`]. No `SA_RESTART`, so a blocked
/// `poll` returns `EINTR` and the relay gets to look at the flag. SIGPIPE
/// is ignored so a vanished reader shows up as `EPIPE` on write.
pub fn install_quit_handlers() -> Result<()> {
    let quit = SigAction::new(SigHandler::Handler(on_quit), SaFlags::empty(), SigSet::empty());
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // SAFETY: on_quit only performs an atomic increment
    unsafe {
        sigaction(Signal::SIGINT, &quit).map_err(Error::Signal)?;
        sigaction(Signal::SIGTERM, &quit).map_err(Error::Signal)?;
        sigaction(Signal::SIGPIPE, &ignore).map_err(Error::Signal)?;
    }
    Ok(())
}

/// Arm the SIGCHLD handler used to cut the shutdown grace period short
pub fn arm_child_exit() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_child_exit),
        SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    // SAFETY: on_child_exit only performs an atomic increment
    unsafe { sigaction(Signal::SIGCHLD, &action) }.map_err(Error::Signal)?;
    Ok(())
}

/// SIGCHLD deliveries seen since [`arm_child_exit`]
pub fn child_exit_count() -> usize {
    CHILD_EXITS.load(Ordering::SeqCst)
}
