//! Short lived `ssh` helpers for commands that must run on the debugging host.

use crate::error::Error;
use crate::io::descriptor::{pipe, InputDescriptor};
use crate::log::log_multiline;
use crate::system::child_reaper::{exit_code, ChildReaper};
use crate::system::exec::ExecArgs;
use crate::system::poll_table::PollTable;
use crate::tracer;
use log::Level;
use nix::libc;
use nix::poll::PollFlags;
use nix::unistd::{ForkResult, Pid};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::rc::Rc;

/// Helpers running at the same time, the rest wait in a queue.
pub const MAX_CHILDREN: usize = 4;

/// Receives the whole stdout of a successful command.
pub type SshCallback = Box<dyn FnOnce(String)>;

struct Queued {
    command: String,
    callback: SshCallback,
}

struct Running {
    pid: Pid,
    stdout: InputDescriptor,
    stderr: InputDescriptor,
    out: Vec<u8>,
    err: Vec<u8>,
    callback: SshCallback,
}

fn cstring(s: &[u8]) -> Result<CString, Error> {
    CString::new(s).map_err(|e| Error::IO(io::Error::new(io::ErrorKind::InvalidInput, e)))
}

pub struct SshDriver {
    program: CString,
    host: CString,
    running: Vec<Running>,
    queue: VecDeque<Queued>,
    /// Filled by reaper callbacks, drained in [`SshDriver::on_poll_results`].
    exited: Rc<RefCell<Vec<(Pid, i32)>>>,
}

impl SshDriver {
    /// Driver for `host` using the `ssh` found in `PATH`.
    pub fn new(host: &str) -> Result<Self, Error> {
        let ssh = which::which("ssh")
            .map_err(|e| Error::IO(io::Error::new(io::ErrorKind::NotFound, e)))?;
        Self::with_program(&ssh, host)
    }

    /// Driver that runs `program` with ssh-compatible arguments.
    pub fn with_program(program: &Path, host: &str) -> Result<Self, Error> {
        Ok(Self {
            program: cstring(program.as_os_str().as_bytes())?,
            host: cstring(host.as_bytes())?,
            running: Vec::with_capacity(MAX_CHILDREN),
            queue: VecDeque::new(),
            exited: Rc::new(RefCell::new(Vec::new())),
        })
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.queue.is_empty()
    }

    /// Run `command` remotely, `callback` gets its output once it succeeds.
    pub fn submit(
        &mut self,
        reaper: &mut ChildReaper,
        command: &str,
        callback: SshCallback,
    ) -> Result<(), Error> {
        if self.running.len() < MAX_CHILDREN {
            self.spawn(reaper, command, callback)
        } else {
            log::debug!(target: "ssh", "Queued: {command}");
            self.queue.push_back(Queued {
                command: command.to_string(),
                callback,
            });
            Ok(())
        }
    }

    pub fn register_for_poll(&self, table: &mut PollTable) {
        for child in &self.running {
            table.register(child.stdout.as_raw_fd(), PollFlags::POLLIN);
            table.register(child.stderr.as_raw_fd(), PollFlags::POLLIN);
        }
    }

    /// Drain ready pipes, then finish reaped helpers and start queued ones.
    pub fn on_poll_results(
        &mut self,
        table: &PollTable,
        reaper: &mut ChildReaper,
    ) -> Result<(), Error> {
        for child in &mut self.running {
            if table.has_input_events(child.stdout.as_raw_fd()) {
                child.stdout.read_available(&mut child.out)?;
            }
            if table.has_input_events(child.stderr.as_raw_fd()) {
                child.stderr.read_available(&mut child.err)?;
            }
        }

        let exited = std::mem::take(&mut *self.exited.borrow_mut());
        for (pid, status) in exited {
            self.on_exited(pid, status)?;
        }
        while self.running.len() < MAX_CHILDREN {
            let Some(Queued { command, callback }) = self.queue.pop_front() else {
                break;
            };
            self.spawn(reaper, &command, callback)?;
        }
        Ok(())
    }

    fn on_exited(&mut self, pid: Pid, status: i32) -> Result<(), Error> {
        let Some(idx) = self.running.iter().position(|c| c.pid == pid) else {
            crate::fatal!("Unknown child {pid} reaped by ssh driver");
        };
        let mut child = self.running.swap_remove(idx);
        // pipes may still hold output written right before exit
        child.stdout.read_available(&mut child.out)?;
        child.stderr.read_available(&mut child.err)?;

        if exit_code(status) == Some(0) {
            let out = match String::from_utf8(child.out) {
                Ok(s) => s,
                Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            };
            (child.callback)(out);
        } else {
            log::error!(target: "ssh", "SSH command failed!");
        }
        if !child.err.is_empty() {
            log_multiline("ssh", Level::Error, &child.err);
        }
        Ok(())
    }

    fn spawn(
        &mut self,
        reaper: &mut ChildReaper,
        command: &str,
        callback: SshCallback,
    ) -> Result<(), Error> {
        let exec = ExecArgs::new(
            self.program.clone(),
            [
                cstring(b"-o")?,
                cstring(b"ConnectTimeout=1")?,
                self.host.clone(),
                cstring(command.as_bytes())?,
            ],
        );
        let dev_null = File::open("/dev/null")?;
        let (out_read, out_write) = pipe()?;
        let (err_read, err_write) = pipe()?;

        // SAFETY: the child only calls async-signal-safe functions before exec.
        let fork = tracer::with(|t| unsafe { t.fork() }).map_err(|e| Error::Syscall("fork", e))?;
        match fork {
            ForkResult::Child => {
                // SAFETY: plain syscalls on descriptors owned by this process.
                unsafe {
                    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                    libc::dup2(dev_null.as_raw_fd(), libc::STDIN_FILENO);
                    libc::dup2(out_write.as_raw_fd(), libc::STDOUT_FILENO);
                    libc::dup2(err_write.as_raw_fd(), libc::STDERR_FILENO);
                }
                _ = exec.exec();
                // SAFETY: exec failed, leave without running any destructor.
                unsafe { libc::_exit(127) }
            }
            ForkResult::Parent { child } => {
                drop((dev_null, out_write, err_write));
                let exited = self.exited.clone();
                reaper.watch(
                    child,
                    (),
                    Box::new(move |pid: Pid, status: i32, _: ()| {
                        exited.borrow_mut().push((pid, status))
                    }),
                )?;
                log::debug!(target: "ssh", "Started ({child}): {command}");
                self.running.push(Running {
                    pid: child,
                    stdout: InputDescriptor::new(out_read)?,
                    stderr: InputDescriptor::new(err_read)?,
                    out: vec![],
                    err: vec![],
                    callback,
                });
                Ok(())
            }
        }
    }
}
