//! runpty - run a program in the slave end of a pseudo terminal
//!
//! Interactive, terminal-driven programs behave differently when their
//! standard streams aren't a terminal. runpty gives them one: it allocates
//! a pty, launches the program on the slave side and relays its own stdin
//! and stdout through the master, so a test harness can drive the program
//! exactly as a terminal session would.
//!
//! - `config`: command line and environment
//! - `relay`: the non-blocking stdin/master/stdout pump
//! - `shutdown`: closing the session and reaping the child
//! - `signals`: quit flag and child-exit notification
//! - `stdio`: descriptor mode bookkeeping

pub mod config;
pub mod error;
pub mod logging;
pub mod relay;
pub mod shutdown;
pub mod signals;
pub mod stdio;

use std::io::{self, IsTerminal};
use std::os::fd::{AsFd, BorrowedFd};

use runpty_pty::{Command, Launched, PtyPair, WindowSize};
use tracing::{debug, info, warn};

pub use config::Config;
pub use error::{Error, Result};
pub use relay::{Relay, RelayEnd};
pub use shutdown::{ChildExit, GRACE_PERIOD};

/// Run one session: allocate, launch, relay, shut down
///
/// Setup failures before the fork come back as errors with nothing to
/// clean up. Once the child exists it is always reaped, even if setting
/// up the relay fails afterwards.
pub fn run(config: &Config) -> Result<ChildExit> {
    let command = Command::new(&config.program)?.args(&config.args)?;
    // Before the fork: a quit request that lands during launch must still
    // end in the child being hung up and reaped
    signals::install_quit_handlers()?;

    let pair = PtyPair::allocate()?;
    if config.inherit_window_size {
        inherit_window_size(&pair, io::stdin().as_fd());
    }
    drop_privileges();

    let Launched { master, child } = command.launch(pair)?;
    info!("running {:?} as pid {}", config.program, child.pid());

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut stdio = stdio::NonBlockingGuard::default();
    let relayed = relay_session(stdin.as_fd(), master.as_fd(), stdout.as_fd(), &mut stdio);

    let exit = shutdown::reap(master, &child, GRACE_PERIOD);
    stdio.restore();

    let end = relayed?;
    debug!("session ended: {}", end);
    exit
}

fn relay_session(
    stdin: BorrowedFd<'_>,
    master: BorrowedFd<'_>,
    stdout: BorrowedFd<'_>,
    stdio: &mut stdio::NonBlockingGuard,
) -> Result<RelayEnd> {
    stdio.set_nonblocking(stdin)?;
    stdio.set_nonblocking(stdout)?;
    runpty_pty::set_nonblocking(master, true)?;

    Ok(Relay::new(stdin, master, stdout).run(&signals::QUIT))
}

/// Give the pty the invoking terminal's geometry. Never fatal.
fn inherit_window_size(pair: &PtyPair, terminal: BorrowedFd<'_>) {
    if !terminal.is_terminal() {
        return;
    }
    match WindowSize::from_fd(terminal) {
        Ok(size) if !size.is_empty() => {
            if let Err(e) = pair.set_window_size(size) {
                warn!("{}", e);
            } else {
                debug!("pty window size {}x{}", size.cols, size.rows);
            }
        }
        Ok(_) => {}
        Err(e) => warn!("failed to read terminal window size: {}", e),
    }
}

/// Some platforms only hand out ptys to euid 0; don't carry that into
/// the child
fn drop_privileges() {
    let uid = nix::unistd::getuid();
    if nix::unistd::geteuid() != uid {
        if let Err(e) = nix::unistd::setuid(uid) {
            warn!("failed to drop setuid privileges: {}", e);
        }
    }
}
