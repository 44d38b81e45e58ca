//! GDB child process speaking GDB/MI.

use crate::error::Error;
use crate::io::descriptor::{pipe, InputDescriptor, OutputDescriptor};
use crate::io::rolling_buffer::RollingBuffer;
use crate::log::log_multiline;
use crate::parser::mi::unescape_in_place;
use crate::system::child_reaper::{describe_status, ChildReaper};
use crate::system::exec::ExecArgs;
use crate::{pdp_assert, tracer};
use log::Level;
use nix::libc;
use nix::unistd::{ForkResult, Pid};
use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use strum_macros::Display;
use timeout_readwrite::TimeoutReader;

/// How long the stderr monitor blocks before it checks the stop flag.
const MONITOR_TICK: Duration = Duration::from_millis(100);
const MONITOR_CHUNK: usize = 256;

/// Arguments that make GDB talk MI without any interactive noise.
pub const GDB_ARGS: [&str; 8] = [
    "--quiet",
    "-iex",
    "set pagination off",
    "-iex",
    "set prompt",
    "-iex",
    "set startup-with-shell off",
    "--interpreter=mi2",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StreamKind {
    Console,
    Target,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AsyncKind {
    Stopped,
    Running,
    CmdParamChanged,
    BreakpointCreated,
    BreakpointDeleted,
    BreakpointModified,
    ThreadCreated,
    ThreadSelected,
    ThreadExited,
    ThreadGroupStarted,
    LibraryLoaded,
    LibraryUnloaded,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ResultKind {
    Done,
    Error,
    Unknown,
}

/// One MI output record. Slices point into the driver's read buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum GdbRecord<'a> {
    Stream {
        kind: StreamKind,
        message: &'a [u8],
    },
    Async {
        token: u32,
        kind: AsyncKind,
        results: &'a [u8],
    },
    Result {
        token: u32,
        kind: ResultKind,
        results: &'a [u8],
    },
}

pub fn classify_async(name: &[u8]) -> AsyncKind {
    if let Some(event) = name.strip_prefix(b"breakpoint-") {
        return match event {
            b"created" => AsyncKind::BreakpointCreated,
            b"deleted" => AsyncKind::BreakpointDeleted,
            b"modified" => AsyncKind::BreakpointModified,
            _ => AsyncKind::Unknown,
        };
    }
    if let Some(event) = name.strip_prefix(b"thread-") {
        return match event {
            b"created" => AsyncKind::ThreadCreated,
            b"selected" => AsyncKind::ThreadSelected,
            b"exited" => AsyncKind::ThreadExited,
            b"group-started" => AsyncKind::ThreadGroupStarted,
            _ => AsyncKind::Unknown,
        };
    }
    match name {
        b"stopped" => AsyncKind::Stopped,
        b"running" => AsyncKind::Running,
        b"cmd-param-changed" => AsyncKind::CmdParamChanged,
        b"library-loaded" => AsyncKind::LibraryLoaded,
        b"library-unloaded" => AsyncKind::LibraryUnloaded,
        _ => AsyncKind::Unknown,
    }
}

pub fn classify_result(name: &[u8]) -> ResultKind {
    match name {
        b"done" | b"running" => ResultKind::Done,
        b"error" | b"exit" => ResultKind::Error,
        _ => ResultKind::Unknown,
    }
}

/// Thread that drains GDB stderr into the log.
struct StderrMonitor {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StderrMonitor {
    fn spawn(fd: OwnedFd) -> Result<Self, Error> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut reader = TimeoutReader::new(File::from(fd), MONITOR_TICK);

        let thread = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("gdb-stderr".to_string())
                .spawn(move || {
                    let mut chunk = [0u8; MONITOR_CHUNK];
                    loop {
                        if stop.load(Ordering::Acquire) {
                            return;
                        }
                        match reader.read(&mut chunk) {
                            Ok(0) => return,
                            Ok(n) => {
                                log::error!(target: "gdb", "Gdb error");
                                log_multiline("gdb", Level::Error, &chunk[..n]);
                            }
                            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                            Err(e) => {
                                log::warn!(target: "gdb", "stderr monitor stopped: {e}");
                                return;
                            }
                        }
                    }
                })?
        };

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!(target: "gdb", "stderr monitor panicked");
            }
        }
    }
}

impl Drop for StderrMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn on_gdb_exited(pid: Pid, status: i32, _: ()) {
    log::warn!(target: "gdb", "Gdb ({pid}) {}", describe_status(status));
}

pub struct GdbDriver {
    pid: Option<Pid>,
    stdin: Option<OutputDescriptor>,
    stdout: InputDescriptor,
    lines: RollingBuffer,
    monitor: Option<StderrMonitor>,
    last_token: u32,
    write_timeout: Duration,
}

impl GdbDriver {
    /// Fork and exec GDB with its standard streams piped to the new driver.
    pub fn start(
        reaper: &mut ChildReaper,
        gdb: &Path,
        program: Option<&str>,
        write_timeout: Duration,
    ) -> Result<Self, Error> {
        let path = CString::new(gdb.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let args = GDB_ARGS
            .iter()
            .copied()
            .chain(program)
            .map(|arg| CString::new(arg).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e)))
            .collect::<Result<Vec<_>, _>>()?;
        let exec = ExecArgs::new(path, args);

        let (in_read, in_write) = pipe()?;
        let (out_read, out_write) = pipe()?;
        let (err_read, err_write) = pipe()?;

        // SAFETY: the child only calls async-signal-safe functions before exec.
        let fork = tracer::with(|t| unsafe { t.fork() }).map_err(|e| Error::Syscall("fork", e))?;
        match fork {
            ForkResult::Child => {
                // SAFETY: plain syscalls on descriptors owned by this process.
                unsafe {
                    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                    libc::dup2(in_read.as_raw_fd(), libc::STDIN_FILENO);
                    libc::dup2(out_write.as_raw_fd(), libc::STDOUT_FILENO);
                    libc::dup2(err_write.as_raw_fd(), libc::STDERR_FILENO);
                }
                _ = exec.exec();
                // SAFETY: exec failed, leave without running any destructor.
                unsafe { libc::_exit(127) }
            }
            ForkResult::Parent { child } => {
                drop((in_read, out_write, err_write));
                reaper.watch(child, (), Box::new(on_gdb_exited))?;
                log::info!(target: "gdb", "Gdb started with pid {child}");

                let mut driver = Self::start_with(in_write, out_read, err_read, write_timeout)?;
                driver.pid = Some(child);
                Ok(driver)
            }
        }
    }

    /// Attach to already running GDB streams.
    pub fn start_with(
        input: OwnedFd,
        output: OwnedFd,
        error: OwnedFd,
        write_timeout: Duration,
    ) -> Result<Self, Error> {
        Ok(Self {
            pid: None,
            stdin: Some(OutputDescriptor::new(input)?),
            stdout: InputDescriptor::new(output)?,
            lines: RollingBuffer::default(),
            monitor: Some(StderrMonitor::spawn(error)?),
            last_token: 0,
            write_timeout,
        })
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Descriptor to poll for records.
    pub fn as_raw_fd(&self) -> RawFd {
        self.stdout.as_raw_fd()
    }

    /// Write `<token><command>\n` in one piece. Tokens must strictly increase.
    pub fn send(&mut self, token: u32, command: &str) -> Result<(), Error> {
        pdp_assert!(
            token > self.last_token,
            "Gdb token {token} after {}",
            self.last_token
        );
        self.last_token = token;

        let Some(stdin) = &self.stdin else {
            return Err(Error::IO(io::Error::from(io::ErrorKind::BrokenPipe)));
        };
        let request = format!("{token}{command}\n");
        log::debug!(target: "gdb", "-> {}", request.trim_end());
        stdin
            .write_exactly(request.as_bytes(), self.write_timeout)
            .map_err(|e| {
                log::warn!(target: "gdb", "Failed to submit request {}", request.trim_end());
                e
            })
    }

    /// Wait until a record may be read without blocking.
    pub fn wait_for_records(&self, timeout: Duration) -> Result<bool, Error> {
        self.lines.wait_for_line(&self.stdout, timeout)
    }

    /// Tell whether a whole record is already buffered.
    pub fn has_buffered(&self) -> bool {
        self.lines.has_line()
    }

    /// Read and classify one record. Empty and unrecognized lines yield `None`.
    pub fn poll_for_records(&mut self) -> Result<Option<GdbRecord<'_>>, Error> {
        let Some(line) = self.lines.read_line(&self.stdout)? else {
            return Ok(None);
        };
        if line.len() <= 1 {
            return Ok(None);
        }
        let len = line.len() - 1;
        let line = &mut line[..len];

        let stream = match line[0] {
            b'~' => Some(StreamKind::Console),
            b'@' => Some(StreamKind::Target),
            b'&' => Some(StreamKind::Log),
            _ => None,
        };
        if let Some(kind) = stream {
            let body = &mut line[1..];
            let message = match unescape_in_place(body) {
                Some(n) => &body[..n],
                None => {
                    log::error!(target: "gdb", "Unexpected start/end of stream message");
                    &body[..]
                }
            };
            return Ok(Some(GdbRecord::Stream { kind, message }));
        }

        let line: &[u8] = line;
        let digits = line.iter().take_while(|b| b.is_ascii_digit()).count();
        let token = line[..digits]
            .iter()
            .fold(0u32, |acc, d| acc.wrapping_mul(10).wrapping_add((d - b'0') as u32));
        let Some(&marker) = line.get(digits) else {
            return Ok(None);
        };
        let rest = &line[digits + 1..];
        let (name, results) = match rest.iter().position(|&b| b == b',') {
            Some(comma) => (&rest[..comma], &rest[comma + 1..]),
            None => (rest, &rest[rest.len()..]),
        };

        match marker {
            _ if name.is_empty() => {
                log::warn!(target: "gdb", "Missing class name for message with token {token}");
                Ok(None)
            }
            b'^' => Ok(Some(GdbRecord::Result {
                token,
                kind: classify_result(name),
                results,
            })),
            b'*' | b'+' | b'=' => Ok(Some(GdbRecord::Async {
                token,
                kind: classify_async(name),
                results,
            })),
            _ => {
                log::trace!(target: "gdb", "skip line: {}", String::from_utf8_lossy(line));
                Ok(None)
            }
        }
    }

    /// Close GDB stdin (GDB exits on its own) and stop the stderr monitor.
    pub fn shutdown(&mut self) {
        self.stdin.take();
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }
    }
}

impl Drop for GdbDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
