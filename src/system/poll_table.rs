use crate::error::Error;
use crate::{fatal, tracer};
use nix::errno::Errno;
use nix::libc;
use nix::poll::PollFlags;
use smallvec::SmallVec;
use std::os::fd::RawFd;
use std::time::Duration;

pub const MAX_ENTRIES: usize = 32;

/// Descriptors watched by one iteration of the core loop.
#[derive(Default)]
pub struct PollTable {
    entries: SmallVec<[libc::pollfd; MAX_ENTRIES]>,
}

impl PollTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn register(&mut self, fd: RawFd, events: PollFlags) {
        if self.entries.len() >= MAX_ENTRIES {
            fatal!("PollTable: overflow");
        }
        if self.entries.iter().any(|e| e.fd == fd) {
            fatal!("PollTable: fd {fd} registered twice");
        }
        self.entries.push(libc::pollfd {
            fd,
            events: events.bits(),
            revents: 0,
        });
    }

    /// Wait for events, returns number of descriptors that have any.
    /// An interrupted wait reports no events.
    pub fn poll(&mut self, timeout: Duration) -> Result<usize, Error> {
        self.sort();
        match tracer::poll(&mut self.entries, timeout) {
            Ok(n) => Ok(n),
            Err(Errno::EINTR) => Ok(0),
            Err(e) => Err(Error::Syscall("poll", e)),
        }
    }

    /// Received events of `fd`, empty if the descriptor is not registered.
    pub fn events(&self, fd: RawFd) -> PollFlags {
        match self.entries.binary_search_by_key(&fd, |e| e.fd) {
            Ok(idx) => PollFlags::from_bits_truncate(self.entries[idx].revents),
            Err(_) => PollFlags::empty(),
        }
    }

    /// `true` if there is something to read or the peer hung up.
    pub fn has_input_events(&self, fd: RawFd) -> bool {
        self.events(fd)
            .intersects(PollFlags::POLLIN | PollFlags::POLLHUP)
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    fn sort(&mut self) {
        for i in 1..self.entries.len() {
            let mut j = i;
            while j > 0 && self.entries[j - 1].fd > self.entries[j].fd {
                self.entries.swap(j - 1, j);
                j -= 1;
            }
        }
    }
}
