//! Relay engine
//!
//! Single-threaded, non-blocking byte pump between the invoking process's
//! standard streams and the pty master:
//!
//! - input: stdin -> master
//! - output: master -> stdout
//!
//! Each direction owns one fixed-size buffer and is always in one of two
//! states. While [`FlowState::Drained`] it watches its source for
//! readability; while [`FlowState::Pending`] it watches its sink for
//! writability and does not read ahead. A buffer is therefore never
//! overwritten before it has been fully flushed, and memory stays bounded
//! at two buffers no matter how long the session runs.
//!
//! The session ends as soon as either side reports end-of-file or a hard
//! I/O error, or when a quit request is seen.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, trace};

use crate::signals::QuitFlag;

/// Per-direction buffer capacity
///
/// Any size makes forward progress; this only trades syscalls for memory.
pub const BUFFER_CAPACITY: usize = 32 * 1024;

/// Fixed-capacity buffer for one direction
///
/// Invariant: `write_offset <= read_len <= capacity`. The buffer is drained
/// exactly when `write_offset == read_len`, and only then may it be refilled.
pub struct DirectionalBuffer {
    data: Box<[u8]>,
    read_len: usize,
    write_offset: usize,
}

impl DirectionalBuffer {
    /// A capacity of zero is bumped to one byte
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity.max(1)].into_boxed_slice(),
            read_len: 0,
            write_offset: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_drained(&self) -> bool {
        self.write_offset == self.read_len
    }

    /// Bytes read from the source but not yet written to the sink
    pub fn pending(&self) -> &[u8] {
        &self.data[self.write_offset..self.read_len]
    }

    /// Refill from `read`, which receives the whole buffer
    ///
    /// Must only be called while drained.
    fn refill<F>(&mut self, read: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        debug_assert!(self.is_drained(), "refilling a buffer with unflushed bytes");
        let n = read(&mut self.data)?;
        debug_assert!(n <= self.data.len());
        self.read_len = n;
        self.write_offset = 0;
        Ok(n)
    }

    /// Mark `n` pending bytes as written
    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.read_len - self.write_offset);
        self.write_offset = (self.write_offset + n).min(self.read_len);
    }
}

impl fmt::Debug for DirectionalBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectionalBuffer")
            .field("capacity", &self.capacity())
            .field("read_len", &self.read_len)
            .field("write_offset", &self.write_offset)
            .finish()
    }
}

/// What a direction is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Buffer empty, watching the source for readability
    Drained,
    /// Buffer holds unflushed bytes, watching the sink for writability
    Pending,
}

/// Source and sink of one direction
#[derive(Debug, Clone, Copy)]
pub struct Route<'fd> {
    pub source: BorrowedFd<'fd>,
    pub sink: BorrowedFd<'fd>,
}

/// Counters kept per direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStats {
    /// Successful non-empty reads from the source
    pub reads: u64,
    /// Bytes written to the sink
    pub bytes: u64,
}

/// Why the relay stopped
#[derive(Debug)]
pub enum RelayEnd {
    /// A quit request was seen
    Quit,
    /// A source hit end-of-file or a sink accepted zero bytes
    Closed { direction: &'static str },
    /// A descriptor reported a hard I/O error
    Failed {
        direction: &'static str,
        error: io::Error,
    },
}

impl fmt::Display for RelayEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEnd::Quit => write!(f, "quit requested"),
            RelayEnd::Closed { direction } => write!(f, "{} closed", direction),
            RelayEnd::Failed { direction, error } => write!(f, "{} failed: {}", direction, error),
        }
    }
}

struct Direction<'fd> {
    name: &'static str,
    route: Route<'fd>,
    buffer: DirectionalBuffer,
    state: FlowState,
    stats: DirectionStats,
}

impl<'fd> Direction<'fd> {
    fn new(name: &'static str, route: Route<'fd>, capacity: usize) -> Self {
        Self {
            name,
            route,
            buffer: DirectionalBuffer::with_capacity(capacity),
            state: FlowState::Drained,
            stats: DirectionStats::default(),
        }
    }

    /// The descriptor and event this direction is waiting on
    fn interest(&self) -> PollFd<'fd> {
        match self.state {
            FlowState::Drained => PollFd::new(self.route.source, PollFlags::POLLIN),
            FlowState::Pending => PollFd::new(self.route.sink, PollFlags::POLLOUT),
        }
    }

    fn on_ready(&mut self) -> Result<(), RelayEnd> {
        match self.state {
            FlowState::Drained => self.pull(),
            FlowState::Pending => self.flush(),
        }
    }

    /// Read a chunk from the source and try to pass it straight on
    fn pull(&mut self) -> Result<(), RelayEnd> {
        let source = self.route.source;
        let n = match self.buffer.refill(|buf| read_fd(source, buf)) {
            Ok(0) => return Err(RelayEnd::Closed { direction: self.name }),
            Ok(n) => n,
            Err(e) if is_transient(&e) => return Ok(()),
            Err(error) => {
                return Err(RelayEnd::Failed {
                    direction: self.name,
                    error,
                })
            }
        };
        self.stats.reads += 1;

        let written = match write_fd(self.route.sink, self.buffer.pending()) {
            Ok(w) => w,
            Err(e) if is_transient(&e) => 0,
            Err(error) => {
                return Err(RelayEnd::Failed {
                    direction: self.name,
                    error,
                })
            }
        };
        self.advance(written);
        trace!(
            "{}({}): read {} bytes, wrote {} bytes",
            self.name,
            self.stats.reads,
            n,
            written
        );
        Ok(())
    }

    /// Write out what an earlier short write left behind
    fn flush(&mut self) -> Result<(), RelayEnd> {
        let left = self.buffer.pending().len();
        match write_fd(self.route.sink, self.buffer.pending()) {
            Ok(0) => Err(RelayEnd::Closed { direction: self.name }),
            Ok(w) => {
                self.advance(w);
                trace!(
                    "{}({}): wrote {} of {} bytes, {} still pending",
                    self.name,
                    self.stats.reads,
                    w,
                    left,
                    self.buffer.pending().len()
                );
                Ok(())
            }
            Err(e) if is_transient(&e) => Ok(()),
            Err(error) => Err(RelayEnd::Failed {
                direction: self.name,
                error,
            }),
        }
    }

    fn advance(&mut self, written: usize) {
        self.buffer.consume(written);
        self.stats.bytes += written as u64;
        self.state = if self.buffer.is_drained() {
            FlowState::Drained
        } else {
            FlowState::Pending
        };
    }
}

/// The two-direction relay
pub struct Relay<'fd> {
    input: Direction<'fd>,
    output: Direction<'fd>,
}

impl<'fd> Relay<'fd> {
    /// Relay `stdin` into the pty `master` and the master into `stdout`
    pub fn new(stdin: BorrowedFd<'fd>, master: BorrowedFd<'fd>, stdout: BorrowedFd<'fd>) -> Self {
        Self::with_routes(
            Route {
                source: stdin,
                sink: master,
            },
            Route {
                source: master,
                sink: stdout,
            },
            BUFFER_CAPACITY,
        )
    }

    /// Relay over arbitrary routes with a given buffer capacity
    ///
    /// All four descriptors are expected to be in non-blocking mode.
    pub fn with_routes(input: Route<'fd>, output: Route<'fd>, capacity: usize) -> Self {
        Self {
            input: Direction::new("input", input, capacity),
            output: Direction::new("output", output, capacity),
        }
    }

    /// Run until the session ends
    pub fn run(&mut self, quit: &QuitFlag) -> RelayEnd {
        loop {
            if let Some(end) = self.turn(PollTimeout::NONE, quit) {
                debug!(
                    "relay finished ({}): input {:?}, output {:?}",
                    end,
                    self.input.stats,
                    self.output.stats
                );
                return end;
            }
        }
    }

    /// One wait-and-service iteration
    ///
    /// Returns `None` while the session goes on, including when the wait
    /// timed out or was interrupted without a quit request.
    pub fn turn(&mut self, timeout: PollTimeout, quit: &QuitFlag) -> Option<RelayEnd> {
        if quit.is_raised() {
            return Some(RelayEnd::Quit);
        }

        let mut fds = [self.input.interest(), self.output.interest()];
        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => {
                return quit.is_raised().then_some(RelayEnd::Quit);
            }
            Err(e) => {
                return Some(RelayEnd::Failed {
                    direction: "poll",
                    error: io::Error::from(e),
                })
            }
        }

        // Hang-ups and errors count as ready: the next read or write
        // reports what actually happened
        let input_ready = fds[0].revents().is_some_and(|r| !r.is_empty());
        let output_ready = fds[1].revents().is_some_and(|r| !r.is_empty());

        if input_ready {
            if let Err(end) = self.input.on_ready() {
                return Some(end);
            }
        }
        if output_ready {
            if let Err(end) = self.output.on_ready() {
                return Some(end);
            }
        }
        None
    }

    pub fn input_state(&self) -> FlowState {
        self.input.state
    }

    pub fn output_state(&self) -> FlowState {
        self.output.state
    }

    /// Unflushed input bytes; never more than one buffer
    pub fn input_pending(&self) -> usize {
        self.input.buffer.pending().len()
    }

    pub fn output_pending(&self) -> usize {
        self.output.buffer.pending().len()
    }

    pub fn input_stats(&self) -> DirectionStats {
        self.input.stats
    }

    pub fn output_stats(&self) -> DirectionStats {
        self.output.stats
    }
}

/// `EAGAIN`/`EWOULDBLOCK` and `EINTR` mean "nothing yet", not failure
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn read_fd(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    nix::unistd::read(fd.as_raw_fd(), buf).map_err(io::Error::from)
}

fn write_fd(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
    nix::unistd::write(fd, buf).map_err(io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::{AsFd, AsRawFd, OwnedFd};
    use std::thread;
    use std::time::Duration;

    use proptest::prelude::*;

    /// A pipe whose relay-side end is non-blocking
    fn pipe_with_nonblocking(read_side: bool) -> (OwnedFd, OwnedFd) {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        // Children forked by other tests mustn't hold on to either end
        for fd in [&read_end, &write_end] {
            nix::fcntl::fcntl(
                fd.as_raw_fd(),
                nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC),
            )
            .unwrap();
        }
        let relay_end = if read_side { &read_end } else { &write_end };
        runpty_pty::set_nonblocking(relay_end.as_fd(), true).unwrap();
        (read_end, write_end)
    }

    fn spawn_writer(fd: OwnedFd, chunks: Vec<Vec<u8>>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut file = File::from(fd);
            for chunk in chunks {
                file.write_all(&chunk).unwrap();
            }
        })
    }

    fn spawn_reader(fd: OwnedFd) -> thread::JoinHandle<Vec<u8>> {
        thread::spawn(move || {
            let mut out = Vec::new();
            File::from(fd).read_to_end(&mut out).unwrap();
            out
        })
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Push `chunks` through the input direction and return what came out
    fn relay_input(chunks: Vec<Vec<u8>>, capacity: usize) -> (Vec<u8>, RelayEnd) {
        let (in_src, in_feed) = pipe_with_nonblocking(true);
        let (in_drain, in_sink) = pipe_with_nonblocking(false);
        let (out_src, _out_feed) = pipe_with_nonblocking(true);
        let (_out_drain, out_sink) = pipe_with_nonblocking(false);

        let writer = spawn_writer(in_feed, chunks);
        let reader = spawn_reader(in_drain);

        let quit = QuitFlag::new();
        let end = {
            let mut relay = Relay::with_routes(
                Route {
                    source: in_src.as_fd(),
                    sink: in_sink.as_fd(),
                },
                Route {
                    source: out_src.as_fd(),
                    sink: out_sink.as_fd(),
                },
                capacity,
            );
            relay.run(&quit)
        };
        drop(in_sink);

        writer.join().unwrap();
        (reader.join().unwrap(), end)
    }

    #[test]
    fn test_buffer_bookkeeping() {
        let mut buffer = DirectionalBuffer::with_capacity(8);
        assert!(buffer.is_drained());
        assert_eq!(buffer.capacity(), 8);

        let n = buffer
            .refill(|buf| {
                buf[..5].copy_from_slice(b"hello");
                Ok(5)
            })
            .unwrap();
        assert_eq!(n, 5);
        assert!(!buffer.is_drained());
        assert_eq!(buffer.pending(), b"hello");

        buffer.consume(2);
        assert_eq!(buffer.pending(), b"llo");
        buffer.consume(3);
        assert!(buffer.is_drained());
        assert!(buffer.pending().is_empty());
    }

    #[test]
    fn test_zero_capacity_is_usable() {
        assert_eq!(DirectionalBuffer::with_capacity(0).capacity(), 1);
    }

    #[test]
    fn test_input_relayed_in_order() {
        let data = pattern(200_000);
        let (out, end) = relay_input(vec![data.clone()], BUFFER_CAPACITY);
        assert!(matches!(end, RelayEnd::Closed { direction: "input" }));
        assert_eq!(out, data);
    }

    #[test]
    fn test_tiny_buffer_forces_partial_writes() {
        let data = pattern(50_000);
        let (out, _) = relay_input(vec![data.clone()], 7);
        assert_eq!(out, data);
    }

    #[test]
    fn test_output_relayed_until_source_closes() {
        let (in_src, _in_feed) = pipe_with_nonblocking(true);
        let (_in_drain, in_sink) = pipe_with_nonblocking(false);
        let (out_src, out_feed) = pipe_with_nonblocking(true);
        let (out_drain, out_sink) = pipe_with_nonblocking(false);

        let data = pattern(150_000);
        let writer = spawn_writer(out_feed, vec![data.clone()]);
        let reader = spawn_reader(out_drain);

        let quit = QuitFlag::new();
        let mut relay = Relay::with_routes(
            Route {
                source: in_src.as_fd(),
                sink: in_sink.as_fd(),
            },
            Route {
                source: out_src.as_fd(),
                sink: out_sink.as_fd(),
            },
            4096,
        );
        let end = relay.run(&quit);
        assert!(matches!(end, RelayEnd::Closed { direction: "output" }));
        assert_eq!(relay.output_stats().bytes, data.len() as u64);
        assert_eq!(relay.input_stats(), DirectionStats::default());
        drop(relay);
        drop(out_sink);

        writer.join().unwrap();
        assert_eq!(reader.join().unwrap(), data);
    }

    #[test]
    fn test_quit_flag_stops_relay() {
        let (in_src, _in_feed) = pipe_with_nonblocking(true);
        let (_in_drain, in_sink) = pipe_with_nonblocking(false);
        let (out_src, _out_feed) = pipe_with_nonblocking(true);
        let (_out_drain, out_sink) = pipe_with_nonblocking(false);

        let quit = QuitFlag::new();
        quit.raise();
        let mut relay = Relay::with_routes(
            Route {
                source: in_src.as_fd(),
                sink: in_sink.as_fd(),
            },
            Route {
                source: out_src.as_fd(),
                sink: out_sink.as_fd(),
            },
            16,
        );
        assert!(matches!(relay.run(&quit), RelayEnd::Quit));
    }

    #[test]
    fn test_idle_turn_times_out() {
        let (in_src, _in_feed) = pipe_with_nonblocking(true);
        let (_in_drain, in_sink) = pipe_with_nonblocking(false);
        let (out_src, _out_feed) = pipe_with_nonblocking(true);
        let (_out_drain, out_sink) = pipe_with_nonblocking(false);

        let quit = QuitFlag::new();
        let mut relay = Relay::with_routes(
            Route {
                source: in_src.as_fd(),
                sink: in_sink.as_fd(),
            },
            Route {
                source: out_src.as_fd(),
                sink: out_sink.as_fd(),
            },
            16,
        );
        assert!(relay.turn(PollTimeout::from(20u16), &quit).is_none());
        assert_eq!(relay.input_state(), FlowState::Drained);
        assert_eq!(relay.output_state(), FlowState::Drained);
    }

    #[test]
    fn test_empty_source_would_block() {
        let (read_end, write_end) = pipe_with_nonblocking(true);
        let mut buf = [0u8; 8];
        let err = read_fd(read_end.as_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(is_transient(&err));

        assert_eq!(write_fd(write_end.as_fd(), b"abc").unwrap(), 3);
        assert_eq!(read_fd(read_end.as_fd(), &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");

        drop(write_end);
        assert_eq!(read_fd(read_end.as_fd(), &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_broken_sink_ends_session() {
        let (in_src, in_feed) = pipe_with_nonblocking(true);
        let (in_drain, in_sink) = pipe_with_nonblocking(false);
        let (out_src, _out_feed) = pipe_with_nonblocking(true);
        let (_out_drain, out_sink) = pipe_with_nonblocking(false);
        drop(in_drain);

        let mut feed = File::from(in_feed);
        feed.write_all(b"nobody listens").unwrap();

        let quit = QuitFlag::new();
        let mut relay = Relay::with_routes(
            Route {
                source: in_src.as_fd(),
                sink: in_sink.as_fd(),
            },
            Route {
                source: out_src.as_fd(),
                sink: out_sink.as_fd(),
            },
            16,
        );
        // The test harness ignores SIGPIPE, so the write fails with EPIPE
        match relay.run(&quit) {
            RelayEnd::Failed { direction, error } => {
                assert_eq!(direction, "input");
                assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);
            }
            other => panic!("unexpected end: {:?}", other),
        }
    }

    #[test]
    fn test_backpressure_bounds_buffering() {
        let capacity = 1024;
        let (in_src, in_feed) = pipe_with_nonblocking(true);
        let (in_drain, in_sink) = pipe_with_nonblocking(false);
        let (out_src, _out_feed) = pipe_with_nonblocking(true);
        let (_out_drain, out_sink) = pipe_with_nonblocking(false);

        let data = pattern(1 << 20);
        let writer = spawn_writer(in_feed, vec![data.clone()]);

        let quit = QuitFlag::new();
        let mut relay = Relay::with_routes(
            Route {
                source: in_src.as_fd(),
                sink: in_sink.as_fd(),
            },
            Route {
                source: out_src.as_fd(),
                sink: out_sink.as_fd(),
            },
            capacity,
        );

        // Nobody drains the sink pipe: the relay must stall with at most
        // one buffer held back rather than keep reading
        let mut stalled = false;
        for _ in 0..500 {
            assert!(relay.turn(PollTimeout::from(10u16), &quit).is_none());
            assert!(relay.input_pending() <= capacity);
            if relay.input_state() == FlowState::Pending {
                let before = relay.input_stats();
                assert!(relay.turn(PollTimeout::from(10u16), &quit).is_none());
                if relay.input_stats() == before {
                    stalled = true;
                    break;
                }
            }
        }
        assert!(stalled, "relay never stalled on a full sink");
        assert!(relay.input_stats().bytes < data.len() as u64);

        let reader = spawn_reader(in_drain);
        let end = relay.run(&quit);
        assert!(matches!(end, RelayEnd::Closed { direction: "input" }));
        drop(relay);
        drop(in_sink);

        writer.join().unwrap();
        assert_eq!(reader.join().unwrap(), data);
    }

    #[test]
    fn test_chunked_writer_with_pauses() {
        let chunks: Vec<Vec<u8>> = (0..20).map(|i| vec![b'a' + i as u8; 100 + i * 37]).collect();
        let expected: Vec<u8> = chunks.concat();

        let (in_src, in_feed) = pipe_with_nonblocking(true);
        let (in_drain, in_sink) = pipe_with_nonblocking(false);
        let (out_src, _out_feed) = pipe_with_nonblocking(true);
        let (_out_drain, out_sink) = pipe_with_nonblocking(false);

        let writer = thread::spawn(move || {
            let mut file = File::from(in_feed);
            for chunk in chunks {
                file.write_all(&chunk).unwrap();
                thread::sleep(Duration::from_millis(2));
            }
        });
        let reader = spawn_reader(in_drain);

        let quit = QuitFlag::new();
        let mut relay = Relay::with_routes(
            Route {
                source: in_src.as_fd(),
                sink: in_sink.as_fd(),
            },
            Route {
                source: out_src.as_fd(),
                sink: out_sink.as_fd(),
            },
            64,
        );
        relay.run(&quit);
        drop(relay);
        drop(in_sink);

        writer.join().unwrap();
        assert_eq!(reader.join().unwrap(), expected);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_chunking_is_transparent(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..3000), 0..12),
            capacity in 1usize..512,
        ) {
            let expected: Vec<u8> = chunks.concat();
            let (out, end) = relay_input(chunks, capacity);
            let closed = matches!(end, RelayEnd::Closed { direction: "input" });
            prop_assert!(closed, "relay ended with {}", end);
            prop_assert_eq!(out, expected);
        }
    }
}
