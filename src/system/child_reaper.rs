use crate::error::Error;
use crate::tracer;
use nix::errno::Errno;
use nix::libc;
use nix::sys::wait::WaitPidFlag;
use nix::unistd::Pid;
use signal_hook::consts::SIGCHLD;
use signal_hook::SigId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const MAX_CHILDREN: usize = 16;

/// Called once a watched child is reaped with its pid, raw wait status and user data.
pub type ReapCallback<T> = Box<dyn FnOnce(Pid, i32, T)>;

/// Human readable form of a raw wait status.
pub fn describe_status(status: i32) -> String {
    if libc::WIFEXITED(status) {
        format!("exited with code {}", libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        format!("killed by signal {}", libc::WTERMSIG(status))
    } else {
        format!("changed state ({status:#x})")
    }
}

/// Exit code of a normally terminated process.
pub fn exit_code(status: i32) -> Option<i32> {
    libc::WIFEXITED(status).then(|| libc::WEXITSTATUS(status))
}

fn log_status<T>(pid: Pid, status: i32, _: T) {
    log::info!(target: "reaper", "Child {pid} {}", describe_status(status));
}

struct Watched<T> {
    pid: Pid,
    on_exit: ReapCallback<T>,
    data: T,
}

/// Table of watched child processes.
///
/// `SIGCHLD` only raises a sticky flag, children are collected from the core loop by
/// [`ChildReaper::reap`]. When an execution trace is recorded or replayed the flag is ignored
/// and every `reap` calls `waitpid`, so both runs issue the same sequence of calls.
pub struct ChildReaper<T = ()> {
    children: Vec<Watched<T>>,
    pending: Arc<AtomicBool>,
    sig_id: SigId,
}

impl<T: 'static> ChildReaper<T> {
    pub fn new() -> Result<Self, Error> {
        let pending = Arc::new(AtomicBool::new(false));
        let sig_id = signal_hook::flag::register(SIGCHLD, pending.clone())?;
        Ok(Self {
            children: Vec::with_capacity(MAX_CHILDREN),
            pending,
            sig_id,
        })
    }

    pub fn watch(&mut self, pid: Pid, data: T, on_exit: ReapCallback<T>) -> Result<(), Error> {
        if self.children.len() >= MAX_CHILDREN {
            return Err(Error::TooManyChildren(MAX_CHILDREN));
        }
        self.children.push(Watched { pid, on_exit, data });
        Ok(())
    }

    /// Watch a child whose exit status is only logged.
    pub fn watch_default(&mut self, pid: Pid, data: T) -> Result<(), Error> {
        self.watch(pid, data, Box::new(log_status))
    }

    /// Stop watching a child, returns its user data.
    pub fn unwatch(&mut self, pid: Pid) -> Option<T> {
        let idx = self.children.iter().position(|c| c.pid == pid)?;
        Some(self.children.swap_remove(idx).data)
    }

    pub fn is_watched(&self, pid: Pid) -> bool {
        self.children.iter().any(|c| c.pid == pid)
    }

    pub fn watched_count(&self) -> usize {
        self.children.len()
    }

    /// Collect every exited child without blocking.
    pub fn reap(&mut self) {
        if self.children.is_empty() {
            return;
        }
        let traced = tracer::with(|t| t.is_recording() || t.is_replaying());
        if !traced && !self.pending.swap(false, Ordering::AcqRel) {
            return;
        }

        while !self.children.is_empty() {
            match tracer::waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok((pid, status)) if pid.as_raw() > 0 => self.on_reaped(pid, status),
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    log::error!(target: "reaper", "waitpid failed: {}", e.desc());
                    break;
                }
            }
        }
    }

    /// Block until every watched child is reaped.
    pub fn reap_all(&mut self) {
        while !self.children.is_empty() {
            match tracer::waitpid(Pid::from_raw(-1), None) {
                Ok((pid, status)) if pid.as_raw() > 0 => self.on_reaped(pid, status),
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => {
                    log::error!(
                        target: "reaper",
                        "waitpid failed: {}, abandoning {} children",
                        e.desc(),
                        self.children.len()
                    );
                    self.children.clear();
                }
            }
        }
    }

    fn on_reaped(&mut self, pid: Pid, status: i32) {
        match self.children.iter().position(|c| c.pid == pid) {
            Some(idx) => {
                let child = self.children.swap_remove(idx);
                (child.on_exit)(pid, status, child.data);
            }
            None => {
                log::warn!(target: "reaper", "Reaped unwatched child {pid}: {}", describe_status(status));
            }
        }
    }
}

impl<T> Drop for ChildReaper<T> {
    fn drop(&mut self) {
        signal_hook::low_level::unregister(self.sig_id);
        if !self.children.is_empty() {
            log::warn!(target: "reaper", "{} children are still watched", self.children.len());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;
    use std::cell::RefCell;
    use std::process::Command;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    fn spawn(script: &str) -> Pid {
        let child = Command::new("sh").args(["-c", script]).spawn().unwrap();
        Pid::from_raw(child.id() as i32)
    }

    #[test]
    fn test_describe_status() {
        struct TestCase {
            status: i32,
            expected: &'static str,
            code: Option<i32>,
        }
        let test_cases = [
            TestCase {
                status: 0,
                expected: "exited with code 0",
                code: Some(0),
            },
            TestCase {
                status: 3 << 8,
                expected: "exited with code 3",
                code: Some(3),
            },
            TestCase {
                status: libc::SIGKILL,
                expected: "killed by signal 9",
                code: None,
            },
        ];

        for tc in test_cases {
            assert_eq!(describe_status(tc.status), tc.expected);
            assert_eq!(exit_code(tc.status), tc.code);
        }
    }

    #[test]
    #[serial]
    fn test_reap_all() {
        let mut reaper = ChildReaper::<&'static str>::new().unwrap();
        let seen = Rc::new(RefCell::new(vec![]));

        for (script, name) in [("exit 0", "ok"), ("exit 3", "three")] {
            let pid = spawn(script);
            let seen = seen.clone();
            reaper
                .watch(
                    pid,
                    name,
                    Box::new(move |_: Pid, status: i32, name: &'static str| {
                        seen.borrow_mut().push((name, exit_code(status)))
                    }),
                )
                .unwrap();
        }
        assert_eq!(reaper.watched_count(), 2);

        reaper.reap_all();
        assert_eq!(reaper.watched_count(), 0);
        let mut seen = seen.borrow().clone();
        seen.sort();
        assert_eq!(seen, vec![("ok", Some(0)), ("three", Some(3))]);
    }

    #[test]
    #[serial]
    fn test_reap_after_signal() {
        let mut reaper = ChildReaper::<()>::new().unwrap();
        let code = Rc::new(RefCell::new(None));
        let pid = spawn("exit 7");
        let code_in_cb = code.clone();
        reaper
            .watch(
                pid,
                (),
                Box::new(move |_: Pid, status: i32, _: ()| {
                    *code_in_cb.borrow_mut() = exit_code(status)
                }),
            )
            .unwrap();
        assert!(reaper.is_watched(pid));

        let start = Instant::now();
        while reaper.watched_count() > 0 && start.elapsed() < Duration::from_secs(5) {
            reaper.reap();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!reaper.is_watched(pid));
        assert_eq!(*code.borrow(), Some(7));
    }

    #[test]
    #[serial]
    fn test_unwatch_and_capacity() {
        let mut reaper = ChildReaper::<u32>::new().unwrap();
        for i in 0..MAX_CHILDREN as i32 {
            reaper.watch_default(Pid::from_raw(1_000_000 + i), i as u32).unwrap();
        }
        assert!(matches!(
            reaper.watch_default(Pid::from_raw(42), 0),
            Err(Error::TooManyChildren(MAX_CHILDREN))
        ));
        assert_eq!(reaper.unwatch(Pid::from_raw(1_000_003)), Some(3));
        assert_eq!(reaper.unwatch(Pid::from_raw(1_000_003)), None);
        assert_eq!(reaper.watched_count(), MAX_CHILDREN - 1);
        while let Some(pid) = reaper.children.first().map(|c| c.pid) {
            reaper.unwatch(pid);
        }
    }
}
