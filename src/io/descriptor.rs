use crate::error::Error;
use crate::tracer;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::unistd::{access, AccessFlags};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::time::{Duration, Instant};

/// Shortest wait between two attempts of a timed read or write.
const MIN_WAIT: Duration = Duration::from_millis(5);

/// Longest path accepted by [`real_path`].
const PATH_MAX: usize = libc::PATH_MAX as usize;

fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| Error::Syscall("fcntl", e))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| Error::Syscall("fcntl", e))?;
    Ok(())
}

/// Poll a single descriptor outside of execution tracer. Returns received events.
fn poll_untraced(fd: RawFd, events: libc::c_short, timeout: Duration) -> nix::Result<libc::c_short> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    // SAFETY: `pfd` is a single valid pollfd structure.
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    Errno::result(ret).map(|_| pfd.revents)
}

/// Read side of a non-blocking descriptor. Every read goes through the execution tracer.
pub struct InputDescriptor {
    fd: OwnedFd,
}

impl InputDescriptor {
    pub fn new(fd: OwnedFd) -> Result<Self, Error> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self { fd })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Single read attempt, a would-block condition reads nothing.
    pub fn read_once(&self, buf: &mut [u8]) -> Result<usize, Error> {
        match tracer::read(self.as_raw_fd(), buf) {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(0),
            Err(e) => Err(Error::Syscall("read", e)),
        }
    }

    /// Append everything that can be read without blocking to `out`. Returns the byte count.
    pub fn read_available(&self, out: &mut Vec<u8>) -> Result<usize, Error> {
        let mut chunk = [0u8; 4096];
        let mut total = 0;
        loop {
            let n = self.read_once(&mut chunk)?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }

    /// Wait until descriptor becomes readable (or hang up). Returns `false` on timeout.
    pub fn wait_for_input(&self, timeout: Duration) -> Result<bool, Error> {
        let mut fds = [libc::pollfd {
            fd: self.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        match tracer::poll(&mut fds, timeout) {
            Ok(n) => Ok(n > 0 && fds[0].revents & (libc::POLLIN | libc::POLLHUP) != 0),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(Error::Syscall("poll", e)),
        }
    }

    /// Read at least `at_least` bytes into `buf` during `timeout`.
    /// Returns the number of bytes read which may exceed `at_least`.
    pub fn read_at_least(
        &self,
        buf: &mut [u8],
        at_least: usize,
        timeout: Duration,
    ) -> Result<usize, Error> {
        debug_assert!(at_least <= buf.len());
        let stopwatch = Instant::now();
        let mut total = self.read_once(buf)?;
        while total < at_least {
            let elapsed = stopwatch.elapsed();
            if !tracer::is_time_less(elapsed, timeout) {
                return Err(Error::Timeout(timeout, "reading descriptor"));
            }
            let wait = timeout.saturating_sub(elapsed).max(MIN_WAIT);
            self.wait_for_input(wait)?;
            total += self.read_once(&mut buf[total..])?;
        }
        Ok(total)
    }
}

/// Write side of a non-blocking descriptor.
///
/// Writes are passed through the execution tracer (a replay discards them), waits for
/// writability are not traced since a replayed write never blocks.
pub struct OutputDescriptor {
    fd: OwnedFd,
}

impl OutputDescriptor {
    pub fn new(fd: OwnedFd) -> Result<Self, Error> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self { fd })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Single write attempt, a would-block condition writes nothing.
    pub fn write_once(&self, buf: &[u8]) -> Result<usize, Error> {
        match tracer::write(self.as_raw_fd(), buf) {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => Ok(0),
            Err(e) => Err(Error::Syscall("write", e)),
        }
    }

    /// Write the whole `buf` during `timeout`.
    pub fn write_exactly(&self, buf: &[u8], timeout: Duration) -> Result<(), Error> {
        let stopwatch = Instant::now();
        let mut written = self.write_once(buf)?;
        while written < buf.len() {
            let elapsed = stopwatch.elapsed();
            if elapsed >= timeout {
                return Err(Error::Timeout(timeout, "writing descriptor"));
            }
            let wait = timeout.saturating_sub(elapsed).max(MIN_WAIT);
            match poll_untraced(self.as_raw_fd(), libc::POLLOUT, wait) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(Error::Syscall("poll", e)),
            }
            written += self.write_once(&buf[written..])?;
        }
        Ok(())
    }
}

/// Pipe with both ends close-on-exec, returns `(reader, writer)`.
pub fn pipe() -> Result<(OwnedFd, OwnedFd), Error> {
    let (reader, writer) = os_pipe::pipe()?;
    // SAFETY: descriptors are freshly created and owned by nobody else.
    unsafe {
        Ok((
            OwnedFd::from_raw_fd(reader.into_raw_fd()),
            OwnedFd::from_raw_fd(writer.into_raw_fd()),
        ))
    }
}

/// Resolve `path` into a canonical absolute path. Paths longer than `PATH_MAX` are truncated.
pub fn real_path(path: &str) -> Option<String> {
    let mut end = path.len().min(PATH_MAX - 1);
    while !path.is_char_boundary(end) {
        end -= 1;
    }
    let resolved = std::fs::canonicalize(&path[..end]).ok()?;
    resolved.into_os_string().into_string().ok()
}

/// Tell whether the file exists and current process may read it.
pub fn file_readable(path: impl AsRef<Path>) -> bool {
    access(path.as_ref(), AccessFlags::R_OK).is_ok()
}
