//! Pipe primitives for manager/worker communication.
//!
//! Each worker gets two one-directional pipes: a *ready* pipe (worker to
//! manager, one byte per readiness report) and a *job* pipe (manager to
//! worker, one job per line). Both are created close-on-exec.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::error::Result;

/// Buffer size for the job pipe reader and writer.
const JOB_BUFFER_SIZE: usize = 16 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
#[derive(Debug)]
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    /// Create from an owned file descriptor.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Create a close-on-exec pipe, returning `(read_end, write_end)`.
    pub fn pair() -> Result<(Self, Self)> {
        Self::pair_with(OFlag::O_CLOEXEC)
    }

    /// Create a close-on-exec, non-blocking pipe.
    pub fn nonblocking_pair() -> Result<(Self, Self)> {
        Self::pair_with(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
    }

    fn pair_with(flags: OFlag) -> Result<(Self, Self)> {
        let (read_fd, write_fd) = nix::unistd::pipe2(flags)?;
        Ok((Self::new(read_fd), Self::new(write_fd)))
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Convert a duration to a poll timeout, saturating at the largest value poll accepts.
pub fn poll_timeout(duration: Duration) -> PollTimeout {
    let millis = i32::try_from(duration.as_millis()).unwrap_or(i32::MAX);
    PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
}

/// Wait until `fd` is readable (or hung up) for at most `timeout`.
///
/// Returns `Ok(false)` on timeout. An interrupting signal surfaces as
/// `Err(Errno::EINTR)` so callers can look at their signal flags.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout: Duration) -> std::result::Result<bool, Errno> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    let n = poll(&mut fds, poll_timeout(timeout))?;
    Ok(n > 0)
}

/// Drain every readiness byte currently buffered in a non-blocking ready pipe.
///
/// Returns the number of bytes consumed; zero means the writer went away.
pub fn drain_ready(fd: &mut PipeFd) -> io::Result<usize> {
    let mut buf = [0u8; 64];
    let mut total = 0;
    loop {
        match fd.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
            Err(e) => return Err(e),
        }
    }
}

/// Buffered line reader for the worker's end of the job pipe.
pub struct LineReader {
    reader: BufReader<PipeFd>,
    line_buffer: String,
}

impl LineReader {
    /// Create a new line reader from a file descriptor.
    pub fn new(fd: PipeFd) -> Self {
        Self {
            reader: BufReader::with_capacity(JOB_BUFFER_SIZE, fd),
            line_buffer: String::with_capacity(256),
        }
    }

    /// Whether a complete or partial line is already buffered in userspace.
    pub fn has_buffered(&self) -> bool {
        !self.reader.buffer().is_empty()
    }

    /// Borrow the underlying descriptor for polling.
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.get_ref().as_fd()
    }

    /// Read one raw line, terminator included. Returns `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line_buffer.clear();
        match self.reader.read_line(&mut self.line_buffer)? {
            0 => Ok(None),
            _ => Ok(Some(&self.line_buffer)),
        }
    }
}

/// Buffered line writer for the manager's end of the job pipe.
pub struct LineWriter {
    writer: BufWriter<PipeFd>,
}

impl LineWriter {
    /// Create a new line writer from a file descriptor.
    pub fn new(fd: PipeFd) -> Self {
        Self {
            writer: BufWriter::with_capacity(JOB_BUFFER_SIZE, fd),
        }
    }

    /// Write a line (appends newline if not present) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_reader_writer_keeps_terminator() {
        let (read_fd, write_fd) = PipeFd::pair().unwrap();
        let mut reader = LineReader::new(read_fd);
        let mut writer = LineWriter::new(write_fd);

        writer.write_line("hello").unwrap();
        writer.write_line("world\n").unwrap();
        writer.write_line("").unwrap();
        drop(writer);

        assert_eq!(reader.read_line().unwrap(), Some("hello\n"));
        assert_eq!(reader.read_line().unwrap(), Some("world\n"));
        assert_eq!(reader.read_line().unwrap(), Some("\n"));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_wait_readable_times_out_on_empty_pipe() {
        let (read_fd, _write_fd) = PipeFd::pair().unwrap();
        let ready = wait_readable(read_fd.as_fd(), Duration::from_millis(20)).unwrap();
        assert!(!ready);
    }

    #[test]
    fn test_wait_readable_sees_data() {
        let (read_fd, mut write_fd) = PipeFd::pair().unwrap();
        write_fd.write_all(b"job\n").unwrap();
        let ready = wait_readable(read_fd.as_fd(), Duration::from_secs(1)).unwrap();
        assert!(ready);
    }

    #[test]
    fn test_drain_ready_counts_and_stops_without_blocking() {
        let (mut read_fd, mut write_fd) = PipeFd::nonblocking_pair().unwrap();
        write_fd.write_all(b"...").unwrap();
        assert_eq!(drain_ready(&mut read_fd).unwrap(), 3);
        // Nothing buffered: returns immediately instead of blocking.
        assert_eq!(drain_ready(&mut read_fd).unwrap(), 0);
    }

    #[test]
    fn test_buffered_detection() {
        let (read_fd, write_fd) = PipeFd::pair().unwrap();
        let mut reader = LineReader::new(read_fd);
        let mut writer = LineWriter::new(write_fd);
        assert!(!reader.has_buffered());

        writer.write_line("one").unwrap();
        writer.write_line("two").unwrap();
        assert_eq!(reader.read_line().unwrap(), Some("one\n"));
        // The second line arrived in the same read and sits in the buffer.
        assert!(reader.has_buffered());
    }

    #[test]
    fn test_poll_timeout_saturates() {
        assert_eq!(poll_timeout(Duration::from_millis(0)), PollTimeout::ZERO);
        assert_eq!(poll_timeout(Duration::from_secs(u64::MAX)), PollTimeout::MAX);
    }
}
