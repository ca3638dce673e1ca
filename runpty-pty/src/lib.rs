//! runpty-pty - pseudoterminal allocation and child launch
//!
//! This crate covers the two setup stages of running a program on a pty:
//! - [`PtyPair::allocate`] obtains a master/slave pair from the host OS,
//!   hiding the platform differences behind one call
//! - [`Command::launch`] forks, makes the slave the child's controlling
//!   terminal and standard streams, and execs the target program
//!
//! Relaying bytes and reaping the child are left to the caller.
//!
//! Reference: https://www.man7.org/linux/man-pages/man3/posix_openpt.3.html

mod child;
mod error;
mod pty;
mod size;

pub use child::{Child, Command, Launched};
pub use error::{Error, Result};
pub use pty::{set_nonblocking, PtyPair, SlaveEnd};
pub use size::WindowSize;
