//! Child launch
//!
//! Forks, attaches the child to the slave side of a [`PtyPair`] and execs
//! the target program. Once forked there is no recovery path inside the
//! child: any failure is reported on the runner's original stderr and the
//! child exits with status 1.

use std::ffi::{CStr, CString, OsStr};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;

use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::libc;
use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, execvp, fork, setsid, ForkResult, Pid};

use crate::error::{Error, Result};
use crate::pty::{PtyPair, SlaveEnd};

/// Program and argument vector to run on the pty
#[derive(Debug, Clone)]
pub struct Command {
    program: CString,
    /// argv, with the program name as argv[0]
    argv: Vec<CString>,
}

impl Command {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Result<Self> {
        let program = to_cstring(program.as_ref())?;
        Ok(Self {
            argv: vec![program.clone()],
            program,
        })
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Result<Self> {
        self.argv.push(to_cstring(arg.as_ref())?);
        Ok(self)
    }

    pub fn args<I, S>(mut self, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self = self.arg(arg)?;
        }
        Ok(self)
    }

    pub fn program(&self) -> &CStr {
        &self.program
    }

    pub fn argv(&self) -> &[CString] {
        &self.argv
    }

    /// Fork and exec this command on the slave side of `pair`
    ///
    /// The parent keeps the master and drops its reference to the slave.
    /// `PATH` lookup follows `execvp`.
    ///
    /// Returns once the child has exec'd or given up. Until the slave has
    /// been opened once, a Linux master polls as hung up, so relaying any
    /// earlier could end the session before it starts.
    pub fn launch(&self, pair: PtyPair) -> Result<Launched> {
        let (master, slave, slave_path) = pair.into_parts();
        let (sync_read, sync_write) = cloexec_pipe().map_err(Error::Fork)?;

        // SAFETY: the child only runs exec_child and then execs or _exits.
        // It still allocates (argv for execvp, the failure message), which
        // relies on the libc's fork handlers leaving malloc usable; callers
        // must not fork while another thread holds a lock the child needs.
        match unsafe { fork() }.map_err(Error::Fork)? {
            ForkResult::Parent { child } => {
                drop(sync_write);
                wait_for_exec(&sync_read);
                drop(slave);
                log::debug!("launched {:?} as pid {}", self.program, child);
                Ok(Launched {
                    master,
                    child: Child { pid: child },
                })
            }
            ForkResult::Child => {
                drop(master);
                drop(sync_read);
                // Held until exec closes it, or until _exit
                let _sync = sync_write;
                // Keep a way to reach the runner's stderr once the slave
                // replaces fd 2. Closed automatically by a successful exec.
                let diagnostics = fcntl(libc::STDERR_FILENO, FcntlArg::F_DUPFD_CLOEXEC(3)).ok();
                let err = match self.exec_child(slave, &slave_path) {
                    Err(e) => e,
                    Ok(never) => match never {},
                };
                if let Some(fd) = diagnostics {
                    let line = format!("\nrunpty: {}\n", err);
                    // SAFETY: fd is our private duplicate of the original stderr
                    unsafe {
                        libc::write(fd, line.as_ptr().cast(), line.len());
                    }
                }
                // SAFETY: _exit skips the parent's atexit handlers and stdio
                // buffers, which the forked copy must not run
                unsafe { libc::_exit(1) }
            }
        }
    }

    /// Runs in the forked child. Returns only on failure.
    fn exec_child(&self, slave: SlaveEnd, slave_path: &str) -> Result<std::convert::Infallible> {
        // Detach from the runner's controlling terminal
        setsid().map_err(Error::Setsid)?;

        let slave = match slave {
            SlaveEnd::Open(fd) => fd,
            SlaveEnd::ByPath => {
                let fd = open(slave_path, OFlag::O_RDWR, Mode::empty()).map_err(Error::OpenSlave)?;
                // SAFETY: open returned a fresh descriptor we now own
                unsafe { OwnedFd::from_raw_fd(fd) }
            }
        };
        let slave_raw = slave.as_raw_fd();

        #[cfg(any(target_os = "solaris", target_os = "illumos"))]
        push_streams_modules(slave_raw)?;

        set_controlling_terminal(slave_raw)?;

        // The Rust runtime ignores SIGPIPE and exec keeps ignored
        // dispositions; the target program expects the default
        // SAFETY: SIG_DFL installs no Rust handler
        let _ = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) };

        for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            dup2(slave_raw, target).map_err(Error::Dup2)?;
        }
        if slave_raw > libc::STDERR_FILENO {
            drop(slave);
        } else {
            // Already one of the standard streams: keep it open, and dup2
            // onto itself didn't clear close-on-exec
            let raw = slave.into_raw_fd();
            fcntl(raw, FcntlArg::F_SETFD(FdFlag::empty())).map_err(Error::Dup2)?;
        }

        execvp(&self.program, &self.argv).map_err(Error::Exec)
    }
}

/// A pipe with both ends close-on-exec
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(OFlag::O_CLOEXEC)
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) = nix::unistd::pipe()?;
    for fd in [&read_end, &write_end] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read_end, write_end))
}

/// Block until every copy of the pipe's write end is closed
fn wait_for_exec(sync: &OwnedFd) {
    let mut buf = [0u8; 1];
    loop {
        match nix::unistd::read(sync.as_raw_fd(), &mut buf) {
            Err(nix::errno::Errno::EINTR) => continue,
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

fn to_cstring(s: &OsStr) -> Result<CString> {
    CString::new(s.as_bytes()).map_err(|_| Error::InvalidArgument(s.to_string_lossy().into_owned()))
}

#[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
fn set_controlling_terminal(fd: RawFd) -> Result<()> {
    // Note: On macOS, TIOCSCTTY is u32 but ioctl expects c_ulong
    // SAFETY: TIOCSCTTY takes no pointer argument
    if unsafe { libc::ioctl(fd, libc::TIOCSCTTY as libc::c_ulong, 0) } < 0 {
        return Err(Error::ControllingTerminal(nix::Error::last()));
    }
    Ok(())
}

/// Opening the slave after setsid() already made it the controlling
/// terminal on STREAMS systems
#[cfg(any(target_os = "solaris", target_os = "illumos"))]
fn set_controlling_terminal(_fd: RawFd) -> Result<()> {
    Ok(())
}

#[cfg(any(target_os = "solaris", target_os = "illumos"))]
fn push_streams_modules(fd: RawFd) -> Result<()> {
    const STR: libc::c_int = (b'S' as libc::c_int) << 8;
    const I_PUSH: libc::c_int = STR | 0o2;
    const I_FIND: libc::c_int = STR | 0o13;

    for (module, name) in [("ptem", b"ptem\0"), ("ldterm", b"ldterm\0")] {
        let name = name.as_ptr().cast::<libc::c_char>();
        // SAFETY: both ioctls read a NUL-terminated module name
        unsafe {
            if libc::ioctl(fd, I_FIND, name) == 0 && libc::ioctl(fd, I_PUSH, name) < 0 {
                return Err(Error::PushModule {
                    module,
                    source: nix::Error::last(),
                });
            }
        }
    }
    Ok(())
}

/// Result of a successful launch, as seen by the parent
#[derive(Debug)]
pub struct Launched {
    /// The pty master; the only channel to the child
    pub master: OwnedFd,
    pub child: Child,
}

/// The launched child process
///
/// Reaping and signalling go through this handle only.
#[derive(Debug)]
pub struct Child {
    pid: Pid,
}

impl Child {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Collect the exit status if the child has already terminated
    pub fn try_wait(&self) -> nix::Result<Option<WaitStatus>> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::StillAlive => Ok(None),
            status => Ok(Some(status)),
        }
    }

    /// Block until the child terminates
    pub fn wait(&self) -> nix::Result<WaitStatus> {
        loop {
            match waitpid(self.pid, None) {
                Err(nix::errno::Errno::EINTR) => continue,
                other => return other,
            }
        }
    }

    pub fn signal(&self, signal: Signal) -> nix::Result<()> {
        kill(self.pid, signal)
    }
}
