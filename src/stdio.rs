//! Descriptor mode bookkeeping
//!
//! The relay needs non-blocking descriptors, but `O_NONBLOCK` lives on the
//! open file description and is shared with whoever else holds the
//! invoking terminal or pipe. The guard remembers the original flags and
//! puts them back.

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};

use crate::error::{Error, Result};

/// Restores saved descriptor flags on [`restore`](Self::restore) or drop
#[derive(Debug, Default)]
pub struct NonBlockingGuard {
    saved: Vec<(RawFd, OFlag)>,
}

impl NonBlockingGuard {
    /// Switch `fd` to non-blocking mode, remembering its current flags
    pub fn set_nonblocking(&mut self, fd: BorrowedFd<'_>) -> Result<()> {
        let raw = fd.as_raw_fd();
        let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL).map_err(Error::Fcntl)?);
        fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(Error::Fcntl)?;
        self.saved.push((raw, flags));
        Ok(())
    }

    /// Put every descriptor back the way it was. Idempotent.
    pub fn restore(&mut self) {
        for (fd, flags) in self.saved.drain(..).rev() {
            if let Err(e) = fcntl(fd, FcntlArg::F_SETFL(flags)) {
                tracing::warn!("failed to restore flags on fd {}: {}", fd, e);
            }
        }
    }
}

impl Drop for NonBlockingGuard {
    fn drop(&mut self) {
        self.restore();
    }
}
