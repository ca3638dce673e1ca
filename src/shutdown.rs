//! Shutdown coordination
//!
//! Once the relay stops, the master is closed (which normally hangs up the
//! child) and the child is reaped. A child that outlives the grace period
//! is killed, so shutdown never takes much longer than [`GRACE_PERIOD`].

use std::os::fd::OwnedFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollTimeout};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use runpty_pty::Child;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::signals;

/// How long a child gets to exit on its own after the master is closed
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Longest single sleep while waiting out the grace period. Every wake
/// re-checks the child, so a SIGCHLD that lands between the check and the
/// sleep costs at most this much.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// How the child terminated, as far as the runner's exit code cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// Normal exit with this code
    Exited(i32),
    /// Killed by a signal
    Signaled(Signal),
    /// Anything else waitpid can report
    Other,
}

impl ChildExit {
    /// Exit code for the runner itself
    ///
    /// A normal exit is propagated as is; everything else is 1.
    pub fn exit_code(&self) -> u8 {
        match *self {
            ChildExit::Exited(code) => u8::try_from(code).unwrap_or(1),
            ChildExit::Signaled(_) | ChildExit::Other => 1,
        }
    }

    /// Line reported to the operator on stderr
    pub fn report(&self) -> Option<String> {
        match self {
            ChildExit::Exited(code) => Some(format!("Child exited with status {}", code)),
            ChildExit::Signaled(signal) => Some(format!(
                "Child terminated by signal {} ({})",
                *signal as i32,
                signal.as_str()
            )),
            ChildExit::Other => None,
        }
    }
}

impl From<WaitStatus> for ChildExit {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => ChildExit::Exited(code),
            WaitStatus::Signaled(_, signal, _) => ChildExit::Signaled(signal),
            _ => ChildExit::Other,
        }
    }
}

/// Close the master and collect the child's exit status
///
/// If the child hasn't exited yet it gets `grace` to do so, after which it
/// is sent SIGKILL and waited for.
pub fn reap(master: OwnedFd, child: &Child, grace: Duration) -> Result<ChildExit> {
    drop(master);

    if let Some(status) = child.try_wait().map_err(Error::Wait)? {
        return Ok(status.into());
    }

    signals::arm_child_exit()?;
    let deadline = Instant::now() + grace;
    debug!("waiting up to {:?} for child {} to exit", grace, child.pid());

    loop {
        // Checked after arming too, so an exit in between isn't missed
        if let Some(status) = child.try_wait().map_err(Error::Wait)? {
            debug!(
                "child exited within grace period ({} SIGCHLD seen)",
                signals::child_exit_count()
            );
            return Ok(status.into());
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        sleep_until_signal((deadline - now).min(WAIT_SLICE))?;
    }

    warn!(
        "child {} did not exit within {:?}, killing it",
        child.pid(),
        grace
    );
    match child.signal(Signal::SIGKILL) {
        // Exited between the last check and the kill
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => return Err(Error::Kill(e)),
    }
    Ok(child.wait().map_err(Error::Wait)?.into())
}

/// Sleep for `duration` or until a signal arrives, whichever is first
fn sleep_until_signal(duration: Duration) -> Result<()> {
    let millis = u16::try_from(duration.as_millis())
        .unwrap_or(u16::MAX)
        .max(1);
    let mut none: [PollFd<'_>; 0] = [];
    match poll(&mut none, PollTimeout::from(millis)) {
        Ok(_) | Err(Errno::EINTR) => Ok(()),
        Err(e) => Err(Error::Wait(e)),
    }
}
