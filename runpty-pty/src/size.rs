//! Terminal window size

use std::os::fd::{AsRawFd, BorrowedFd};

/// Window size in characters and pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    /// Number of rows (characters)
    pub rows: u16,
    /// Number of columns (characters)
    pub cols: u16,
    /// Width in pixels (optional, can be 0)
    pub pixel_width: u16,
    /// Height in pixels (optional, can be 0)
    pub pixel_height: u16,
}

impl WindowSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Read the window size of the terminal behind `fd`
    ///
    /// Fails with `ENOTTY` when `fd` is not a terminal.
    pub fn from_fd(fd: BorrowedFd<'_>) -> nix::Result<Self> {
        let mut ws = Self::new(0, 0).to_winsize();
        // SAFETY: TIOCGWINSZ writes a winsize struct through the pointer
        let result =
            unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ as libc::c_ulong, &mut ws) };
        if result == -1 {
            Err(nix::Error::last())
        } else {
            Ok(Self::from(ws))
        }
    }

    /// A size of zero rows or columns means the terminal never had one set
    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    pub fn to_winsize(&self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl From<libc::winsize> for WindowSize {
    fn from(ws: libc::winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}
