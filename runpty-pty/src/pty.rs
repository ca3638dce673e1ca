//! Pty allocation
//!
//! Produces a connected master/slave pair. Platforms differ in how that is
//! done, so [`PtyPair::allocate`] picks a backend at compile time:
//!
//! - macOS and the BSDs use `openpty()`, which opens both ends at once.
//!   On macOS a `posix_openpt()` master isn't fully functional until the
//!   slave side is opened, so the slave descriptor is kept and handed to
//!   the child.
//! - Everything else uses `posix_openpt()` + `grantpt()` + `unlockpt()` and
//!   only records the slave path; the child opens it after `setsid()` so
//!   the slave becomes its controlling terminal.

use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};

use crate::error::{Error, Result};
use crate::size::WindowSize;

/// How the child gets hold of the slave side
pub enum SlaveEnd {
    /// The backend opened the slave alongside the master
    Open(OwnedFd),
    /// Only the path is known; the child opens it itself
    ByPath,
}

/// A freshly allocated pseudoterminal pair
///
/// The master is always valid. The pair is owned by the parent until
/// [`Command::launch`](crate::Command::launch) consumes it.
pub struct PtyPair {
    master: OwnedFd,
    slave: SlaveEnd,
    slave_path: String,
}

impl PtyPair {
    /// Allocate a master/slave pair from the host OS
    pub fn allocate() -> Result<Self> {
        let pair = open_pair()?;
        // Neither end may leak into programs exec'd later; the child gets
        // the slave through dup2, which clears the flag
        set_cloexec(pair.master.as_raw_fd())?;
        if let SlaveEnd::Open(slave) = &pair.slave {
            set_cloexec(slave.as_raw_fd())?;
        }
        log::debug!(
            "allocated pty master fd {} slave {} ({})",
            pair.master.as_raw_fd(),
            pair.slave_path,
            match pair.slave {
                SlaveEnd::Open(_) => "open",
                SlaveEnd::ByPath => "by path",
            }
        );
        Ok(pair)
    }

    /// Filesystem path of the slave device
    pub fn slave_path(&self) -> &str {
        &self.slave_path
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Set the window size the child will see on its terminal
    pub fn set_window_size(&self, size: WindowSize) -> Result<()> {
        let ws = size.to_winsize();
        // SAFETY: TIOCSWINSZ reads a winsize struct from the pointer
        let result = unsafe {
            libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ as libc::c_ulong, &ws)
        };
        if result == -1 {
            Err(Error::WindowSize(nix::Error::last()))
        } else {
            Ok(())
        }
    }

    pub fn get_window_size(&self) -> Result<WindowSize> {
        WindowSize::from_fd(self.master.as_fd()).map_err(Error::WindowSize)
    }

    pub(crate) fn into_parts(self) -> (OwnedFd, SlaveEnd, String) {
        (self.master, self.slave, self.slave_path)
    }
}

impl AsFd for PtyPair {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

impl fmt::Debug for PtyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyPair")
            .field("master", &self.master.as_raw_fd())
            .field(
                "slave",
                &match &self.slave {
                    SlaveEnd::Open(fd) => Some(fd.as_raw_fd()),
                    SlaveEnd::ByPath => None,
                },
            )
            .field("slave_path", &self.slave_path)
            .finish()
    }
}

/// Switch `O_NONBLOCK` on or off for a descriptor
pub fn set_nonblocking(fd: BorrowedFd<'_>, nonblocking: bool) -> Result<()> {
    let raw = fd.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(raw, FcntlArg::F_GETFL).map_err(Error::Fcntl)?);
    let new_flags = if nonblocking {
        flags | OFlag::O_NONBLOCK
    } else {
        flags & !OFlag::O_NONBLOCK
    };
    fcntl(raw, FcntlArg::F_SETFL(new_flags)).map_err(Error::Fcntl)?;
    Ok(())
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(Error::Fcntl)?;
    Ok(())
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
fn open_pair() -> Result<PtyPair> {
    use nix::pty::openpty;

    let result = openpty(None, None).map_err(Error::OpenMaster)?;
    // SAFETY: ttyname returns a pointer into static storage; we copy it out
    // before anything else can call it
    let slave_path = unsafe {
        let name = libc::ttyname(result.slave.as_raw_fd());
        if name.is_null() {
            return Err(Error::SlaveName(nix::Error::last()));
        }
        std::ffi::CStr::from_ptr(name).to_string_lossy().into_owned()
    };
    Ok(PtyPair {
        master: result.master,
        slave: SlaveEnd::Open(result.slave),
        slave_path,
    })
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
fn open_pair() -> Result<PtyPair> {
    use std::os::fd::{FromRawFd, IntoRawFd};

    use nix::pty::{grantpt, posix_openpt, unlockpt};

    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(Error::OpenMaster)?;
    grantpt(&master).map_err(Error::Grant)?;
    unlockpt(&master).map_err(Error::Unlock)?;
    let slave_path = slave_name(&master).map_err(Error::SlaveName)?;
    // SAFETY: into_raw_fd hands over sole ownership of a valid descriptor
    let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
    Ok(PtyPair {
        master,
        slave: SlaveEnd::ByPath,
        slave_path,
    })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn slave_name(master: &nix::pty::PtyMaster) -> nix::Result<String> {
    nix::pty::ptsname_r(master)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
fn slave_name(master: &nix::pty::PtyMaster) -> nix::Result<String> {
    // SAFETY: ptsname uses static storage; the runner is single threaded
    // and copies the name out immediately
    unsafe { nix::pty::ptsname(master) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate() {
        let pair = PtyPair::allocate().unwrap();
        assert!(pair.master_fd() >= 0);
        assert!(pair.slave_path().starts_with("/dev/"));
        #[cfg(target_os = "linux")]
        assert!(pair.slave_path().starts_with("/dev/pts/"));
        #[cfg(target_os = "macos")]
        assert!(pair.slave_path().starts_with("/dev/ttys"));
    }

    #[test]
    fn test_pairs_are_distinct() {
        let a = PtyPair::allocate().unwrap();
        let b = PtyPair::allocate().unwrap();
        assert_ne!(a.master_fd(), b.master_fd());
        assert_ne!(a.slave_path(), b.slave_path());
    }

    #[test]
    fn test_master_is_close_on_exec() {
        let pair = PtyPair::allocate().unwrap();
        let flags = FdFlag::from_bits_truncate(fcntl(pair.master_fd(), FcntlArg::F_GETFD).unwrap());
        assert!(flags.contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn test_window_size() {
        let pair = PtyPair::allocate().unwrap();
        pair.set_window_size(WindowSize::new(120, 40)).unwrap();
        let retrieved = pair.get_window_size().unwrap();
        assert_eq!(retrieved.cols, 120);
        assert_eq!(retrieved.rows, 40);
    }

    #[test]
    fn test_nonblocking_toggle() {
        let pair = PtyPair::allocate().unwrap();
        set_nonblocking(pair.as_fd(), true).unwrap();
        let flags = OFlag::from_bits_truncate(fcntl(pair.master_fd(), FcntlArg::F_GETFL).unwrap());
        assert!(flags.contains(OFlag::O_NONBLOCK));

        set_nonblocking(pair.as_fd(), false).unwrap();
        let flags = OFlag::from_bits_truncate(fcntl(pair.master_fd(), FcntlArg::F_GETFL).unwrap());
        assert!(!flags.contains(OFlag::O_NONBLOCK));
    }
}
