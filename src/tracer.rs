//! Record/replay shim over non-deterministic syscalls.
//!
//! Every call that may observe a different outcome between two runs (`read`, `poll`, `fork`,
//! `waitpid` and elapsed time comparisons) goes through an [`ExecutionTracer`]. In record mode
//! the outcome is appended to a trace file, in replay mode it is synthesized from that file so
//! the coordinator walks exactly the same control flow without any peer process.
//!
//! Trace layout: one tag byte followed by a big-endian payload.
//!
//! | Tag           | Payload                                               |
//! |---------------|-------------------------------------------------------|
//! | `Read`        | i32 ret, i32 fd, `ret` bytes when `ret > 0`           |
//! | `Poll`        | i32 ret, when `ret > 0`: i32 nfds, nfds × i16 revents |
//! | `Fork`        | i32 child pid                                         |
//! | `WaitPid`     | i32 ret, i32 status when `ret > 0`                    |
//! | `TimeLess`    | -                                                     |
//! | `TimeNotLess` | -                                                     |
//!
//! Failed calls store `-errno` as a return value so replay reproduces the error kind.

use crate::error::Error;
use crate::fatal;
use memmap2::Mmap;
use nix::errno::Errno;
use nix::libc;
use nix::sys::wait::{WaitPidFlag, WaitStatus};
use nix::unistd::{ForkResult, Pid};
use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::RawFd;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Tag {
    Read = 0,
    Fork = 1,
    WaitPid = 2,
    Poll = 3,
    TimeLess = 4,
    TimeNotLess = 5,
}

enum Mode {
    Normal,
    Record(File),
    Replay { map: Mmap, pos: usize },
}

pub struct ExecutionTracer {
    mode: Mode,
}

impl Default for ExecutionTracer {
    fn default() -> Self {
        Self::normal()
    }
}

fn errno_ret(errno: Errno) -> i32 {
    -(errno as i32)
}

/// Status word of a wait outcome in the `wait(2)` layout, a zero pid when nothing changed.
fn raw_status(status: WaitStatus) -> (Pid, i32) {
    match status {
        WaitStatus::Exited(pid, code) => (pid, (code & 0xff) << 8),
        WaitStatus::Signaled(pid, sig, core) => (pid, sig as i32 | if core { 0x80 } else { 0 }),
        WaitStatus::Stopped(pid, sig) => (pid, (sig as i32) << 8 | 0x7f),
        WaitStatus::Continued(pid) => (pid, 0xffff),
        WaitStatus::StillAlive => (Pid::from_raw(0), 0),
        other => (other.pid().unwrap_or(Pid::from_raw(0)), 0x7f),
    }
}

fn ret_to_result(ret: i32) -> nix::Result<usize> {
    if ret < 0 {
        Err(Errno::from_i32(-ret))
    } else {
        Ok(ret as usize)
    }
}

impl ExecutionTracer {
    /// Passthrough tracer, nothing is recorded.
    pub fn normal() -> Self {
        Self { mode: Mode::Normal }
    }

    /// Create tracer that writes every observation into a fresh trace file.
    pub fn record(path: &Path) -> Result<Self, Error> {
        // std opens files with O_CLOEXEC
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            mode: Mode::Record(file),
        })
    }

    /// Create tracer that synthesizes observations from an existing trace file.
    pub fn replay(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        // SAFETY: trace files are never modified while a replay is running.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self {
            mode: Mode::Replay { map, pos: 0 },
        })
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.mode, Mode::Record(_))
    }

    pub fn is_replaying(&self) -> bool {
        matches!(self.mode, Mode::Replay { .. })
    }

    /// Read from a descriptor. Returns a number of read bytes.
    pub fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
        if self.is_replaying() {
            self.expect_tag(Tag::Read);
            let ret = self.replay_i32();
            let recorded_fd = self.replay_i32();
            if recorded_fd != fd {
                self.corrupted(format_args!("Record fd {recorded_fd} does not match fd {fd}"));
            }
            if ret > 0 {
                let len = ret as usize;
                if len > buf.len() {
                    self.corrupted(format_args!("Read of {len} bytes into {}", buf.len()));
                }
                buf[..len].copy_from_slice(self.replay_bytes(len));
            }
            return ret_to_result(ret);
        }

        let result = nix::unistd::read(fd, buf);
        if let Mode::Record(file) = &mut self.mode {
            let ret = match result {
                Ok(n) => n as i32,
                Err(errno) => errno_ret(errno),
            };
            let mut record = Vec::with_capacity(9 + ret.max(0) as usize);
            record.push(Tag::Read as u8);
            record.extend_from_slice(&ret.to_be_bytes());
            record.extend_from_slice(&fd.to_be_bytes());
            if ret > 0 {
                record.extend_from_slice(&buf[..ret as usize]);
            }
            Self::append(file, &record);
        }
        result
    }

    /// Write into a descriptor. Replay mode pretends that everything is written.
    pub fn write(&mut self, fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
        if self.is_replaying() {
            return Ok(buf.len());
        }
        nix::unistd::write(fd, buf)
    }

    /// Wait for events on a set of descriptors. Returns a number of descriptors with events.
    pub fn poll(&mut self, fds: &mut [libc::pollfd], timeout: Duration) -> nix::Result<usize> {
        if self.is_replaying() {
            self.expect_tag(Tag::Poll);
            let ret = self.replay_i32();
            if ret > 0 {
                let nfds = self.replay_i32();
                if nfds as usize != fds.len() {
                    self.corrupted(format_args!("Poll of {} fds, recorded {nfds}", fds.len()));
                }
                for pfd in fds.iter_mut() {
                    pfd.revents = self.replay_i16();
                }
            } else {
                fds.iter_mut().for_each(|pfd| pfd.revents = 0);
            }
            return ret_to_result(ret);
        }

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        // nix `PollFd` borrows its descriptor, poll tables keep raw `pollfd` entries.
        // SAFETY: `fds` is a valid array of `fds.len()` pollfd structures.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        let result = Errno::result(ret).map(|n| n as usize);
        if let Mode::Record(file) = &mut self.mode {
            let ret = match result {
                Ok(n) => n as i32,
                Err(errno) => errno_ret(errno),
            };
            let mut record = Vec::with_capacity(9 + 2 * fds.len());
            record.push(Tag::Poll as u8);
            record.extend_from_slice(&ret.to_be_bytes());
            if ret > 0 {
                record.extend_from_slice(&(fds.len() as i32).to_be_bytes());
                for pfd in fds.iter() {
                    record.extend_from_slice(&pfd.revents.to_be_bytes());
                }
            }
            Self::append(file, &record);
        }
        result
    }

    /// Fork current process. Replay mode does not fork and returns the recorded child pid.
    ///
    /// # Safety
    ///
    /// Same as [`nix::unistd::fork`]: the child may only call async-signal-safe functions
    /// until it execs.
    pub unsafe fn fork(&mut self) -> nix::Result<ForkResult> {
        if self.is_replaying() {
            self.expect_tag(Tag::Fork);
            let child = self.replay_i32();
            return Ok(ForkResult::Parent {
                child: Pid::from_raw(child),
            });
        }

        let result = nix::unistd::fork()?;
        if let (ForkResult::Parent { child }, Mode::Record(file)) = (&result, &mut self.mode) {
            let mut record = [0u8; 5];
            record[0] = Tag::Fork as u8;
            record[1..].copy_from_slice(&child.as_raw().to_be_bytes());
            Self::append(file, &record);
        }
        Ok(result)
    }

    /// Wait for a child state change. Returns pid of the child and its raw status,
    /// a zero pid means that no child changed state (`WNOHANG`).
    pub fn waitpid(&mut self, pid: Pid, options: Option<WaitPidFlag>) -> nix::Result<(Pid, i32)> {
        if self.is_replaying() {
            self.expect_tag(Tag::WaitPid);
            let ret = self.replay_i32();
            if ret < 0 {
                return Err(Errno::from_i32(-ret));
            }
            let status = if ret > 0 { self.replay_i32() } else { 0 };
            return Ok((Pid::from_raw(ret), status));
        }

        let result = nix::sys::wait::waitpid(pid, options).map(raw_status);
        if let Mode::Record(file) = &mut self.mode {
            let (ret, status) = match result {
                Ok((pid, status)) => (pid.as_raw(), status),
                Err(errno) => (errno_ret(errno), 0),
            };
            let mut record = Vec::with_capacity(9);
            record.push(Tag::WaitPid as u8);
            record.extend_from_slice(&ret.to_be_bytes());
            if ret > 0 {
                record.extend_from_slice(&status.to_be_bytes());
            }
            Self::append(file, &record);
        }
        result
    }

    /// Compare two time intervals, the outcome is part of the trace.
    pub fn is_time_less(&mut self, lhs: Duration, rhs: Duration) -> bool {
        if self.is_replaying() {
            return match self.replay_tag() {
                Tag::TimeLess => true,
                Tag::TimeNotLess => false,
                tag => self.corrupted(format_args!("Unexpected tag {tag:?}, expecting time")),
            };
        }

        let less = lhs < rhs;
        if let Mode::Record(file) = &mut self.mode {
            let tag = if less { Tag::TimeLess } else { Tag::TimeNotLess };
            Self::append(file, &[tag as u8]);
        }
        less
    }

    /// Report whether a replay consumed the whole trace.
    pub fn check_end_of_stream(&self) -> bool {
        match &self.mode {
            Mode::Replay { map, pos } if *pos >= map.len() => {
                log::info!(target: "tracer", "Replay EOS reached.");
                true
            }
            Mode::Replay { map, pos } => {
                log::warn!(target: "tracer", "Replay still in progress ({pos}/{} bytes)", map.len());
                false
            }
            _ => true,
        }
    }

    fn append(file: &mut File, record: &[u8]) {
        if let Err(e) = file.write_all(record) {
            fatal!("Cannot append to execution trace: {e}");
        }
    }

    fn replay_bytes(&mut self, len: usize) -> &[u8] {
        let Mode::Replay { map, pos } = &mut self.mode else {
            fatal!("Tracer is not replaying")
        };
        if *pos + len > map.len() {
            fatal!("Execution trace truncated: need {len} bytes at {pos}");
        }
        let start = *pos;
        *pos += len;
        &map[start..start + len]
    }

    fn replay_i32(&mut self) -> i32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.replay_bytes(4));
        i32::from_be_bytes(bytes)
    }

    fn replay_i16(&mut self) -> i16 {
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(self.replay_bytes(2));
        i16::from_be_bytes(bytes)
    }

    fn replay_tag(&mut self) -> Tag {
        let byte = self.replay_bytes(1)[0];
        match byte {
            0 => Tag::Read,
            1 => Tag::Fork,
            2 => Tag::WaitPid,
            3 => Tag::Poll,
            4 => Tag::TimeLess,
            5 => Tag::TimeNotLess,
            _ => self.corrupted(format_args!("Unexpected byte {byte:#04x}")),
        }
    }

    fn expect_tag(&mut self, expected: Tag) {
        let tag = self.replay_tag();
        if tag != expected {
            self.corrupted(format_args!("Unexpected tag {tag:?}, expecting {expected:?}"));
        }
    }

    fn corrupted(&self, what: std::fmt::Arguments) -> ! {
        let dump = match &self.mode {
            Mode::Replay { map, pos } => {
                let start = pos.saturating_sub(8);
                let end = (pos + 8).min(map.len());
                map[start..end]
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            }
            _ => String::new(),
        };
        fatal!("{}; trace near offset: [{dump}]", Error::TraceCorrupted(what.to_string()))
    }
}

thread_local! {
    static RECORDER: RefCell<ExecutionTracer> = RefCell::new(ExecutionTracer::normal());
}

/// Install a tracer for the current (core loop) thread, returns the previous one.
pub fn install(tracer: ExecutionTracer) -> ExecutionTracer {
    RECORDER.with(|recorder| recorder.replace(tracer))
}

/// Run `f` against the installed tracer.
pub fn with<R>(f: impl FnOnce(&mut ExecutionTracer) -> R) -> R {
    RECORDER.with(|recorder| f(&mut recorder.borrow_mut()))
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    with(|t| t.read(fd, buf))
}

pub fn write(fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
    with(|t| t.write(fd, buf))
}

pub fn poll(fds: &mut [libc::pollfd], timeout: Duration) -> nix::Result<usize> {
    with(|t| t.poll(fds, timeout))
}

pub fn waitpid(pid: Pid, options: Option<WaitPidFlag>) -> nix::Result<(Pid, i32)> {
    with(|t| t.waitpid(pid, options))
}

pub fn is_time_less(lhs: Duration, rhs: Duration) -> bool {
    with(|t| t.is_time_less(lhs, rhs))
}

pub fn is_replaying() -> bool {
    with(|t| t.is_replaying())
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::path::PathBuf;

    fn trace_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pdp-{}-{name}.trace", std::process::id()))
    }

    #[test]
    fn test_record_replay_read() {
        let data_path = trace_path("read-data");
        let trace = trace_path("read");
        let mut payload = b"hello record replay".to_vec();
        payload.push(0);
        std::fs::write(&data_path, &payload).unwrap();

        let data = File::open(&data_path).unwrap();
        let fd = data.as_raw_fd();
        let mut buf = [0u8; 64];
        let recorded = {
            let mut tracer = ExecutionTracer::record(&trace).unwrap();
            tracer.read(fd, &mut buf).unwrap()
        };
        assert_eq!(recorded, payload.len());
        assert_eq!(&buf[..recorded], payload.as_slice());

        let mut tracer = ExecutionTracer::replay(&trace).unwrap();
        let mut replayed = [0u8; 64];
        let ret = tracer.read(fd, &mut replayed).unwrap();
        assert_eq!(ret, recorded);
        assert_eq!(&replayed[..ret], payload.as_slice());
        assert!(tracer.check_end_of_stream());

        std::fs::remove_file(data_path).unwrap();
        std::fs::remove_file(trace).unwrap();
    }

    #[test]
    #[should_panic(expected = "Record fd")]
    fn test_replay_read_fd_mismatch() {
        let trace = trace_path("fd-mismatch");
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        writer.write_all(b"abc").unwrap();
        let fd = reader.as_raw_fd();
        {
            let mut tracer = ExecutionTracer::record(&trace).unwrap();
            let mut buf = [0u8; 8];
            tracer.read(fd, &mut buf).unwrap();
        }
        let mut tracer = ExecutionTracer::replay(&trace).unwrap();
        std::fs::remove_file(&trace).unwrap();
        let mut buf = [0u8; 8];
        _ = tracer.read(fd + 100, &mut buf);
    }

    #[test]
    fn test_record_replay_poll() {
        let trace = trace_path("poll");
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        writer.write_all(b"x").unwrap();

        let mut fds = [libc::pollfd {
            fd: reader.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        {
            let mut tracer = ExecutionTracer::record(&trace).unwrap();
            assert_eq!(tracer.poll(&mut fds, Duration::from_millis(100)).unwrap(), 1);
            assert!(!tracer.is_time_less(Duration::from_millis(5), Duration::from_millis(1)));
        }
        let recorded_revents = fds[0].revents;
        assert_ne!(recorded_revents & libc::POLLIN, 0);

        fds[0].revents = 0;
        let mut tracer = ExecutionTracer::replay(&trace).unwrap();
        assert_eq!(tracer.poll(&mut fds, Duration::ZERO).unwrap(), 1);
        assert_eq!(fds[0].revents, recorded_revents);
        assert!(!tracer.is_time_less(Duration::from_millis(1), Duration::from_millis(5)));
        assert!(tracer.check_end_of_stream());

        std::fs::remove_file(trace).unwrap();
    }

    #[test]
    fn test_replay_write_has_no_side_effects() {
        let trace = trace_path("write");
        std::fs::write(&trace, []).unwrap();
        let (mut reader, writer) = os_pipe::pipe().unwrap();
        let mut tracer = ExecutionTracer::replay(&trace).unwrap();
        assert_eq!(tracer.write(writer.as_raw_fd(), b"discarded").unwrap(), 9);
        drop(writer);
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut reader, &mut out).unwrap();
        assert!(out.is_empty());
        std::fs::remove_file(trace).unwrap();
    }

    #[test]
    #[serial]
    fn test_record_replay_fork_waitpid() {
        let trace = trace_path("fork");
        let (child, status) = {
            let mut tracer = ExecutionTracer::record(&trace).unwrap();
            let child = match unsafe { tracer.fork() }.unwrap() {
                ForkResult::Child => unsafe { libc::_exit(42) },
                ForkResult::Parent { child } => child,
            };
            let (pid, status) = tracer.waitpid(child, None).unwrap();
            assert_eq!(pid, child);
            (child, status)
        };
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 42);

        let mut tracer = ExecutionTracer::replay(&trace).unwrap();
        match unsafe { tracer.fork() }.unwrap() {
            ForkResult::Parent { child: replayed } => assert_eq!(replayed, child),
            ForkResult::Child => unreachable!(),
        }
        assert_eq!(tracer.waitpid(child, None).unwrap(), (child, status));
        assert!(tracer.check_end_of_stream());
        std::fs::remove_file(trace).unwrap();
    }

    #[test]
    fn test_raw_status_layout() {
        use nix::sys::signal::Signal;

        struct TestCase {
            status: WaitStatus,
            pid: i32,
            exited: Option<i32>,
            signaled: Option<i32>,
        }
        let pid = Pid::from_raw(1234);
        let test_cases = [
            TestCase {
                status: WaitStatus::Exited(pid, 42),
                pid: 1234,
                exited: Some(42),
                signaled: None,
            },
            TestCase {
                status: WaitStatus::Exited(pid, 0),
                pid: 1234,
                exited: Some(0),
                signaled: None,
            },
            TestCase {
                status: WaitStatus::Signaled(pid, Signal::SIGKILL, false),
                pid: 1234,
                exited: None,
                signaled: Some(libc::SIGKILL),
            },
            TestCase {
                status: WaitStatus::Signaled(pid, Signal::SIGSEGV, true),
                pid: 1234,
                exited: None,
                signaled: Some(libc::SIGSEGV),
            },
            TestCase {
                status: WaitStatus::StillAlive,
                pid: 0,
                exited: None,
                signaled: None,
            },
        ];

        for tc in test_cases {
            let (pid, status) = raw_status(tc.status);
            assert_eq!(pid.as_raw(), tc.pid);
            if tc.pid == 0 {
                continue;
            }
            assert_eq!(
                libc::WIFEXITED(status).then(|| libc::WEXITSTATUS(status)),
                tc.exited
            );
            assert_eq!(
                libc::WIFSIGNALED(status).then(|| libc::WTERMSIG(status)),
                tc.signaled
            );
        }
    }
}
