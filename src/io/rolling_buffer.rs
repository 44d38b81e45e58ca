use crate::error::Error;
use crate::fatal;
use crate::io::descriptor::InputDescriptor;
use std::time::Duration;

/// Smallest free tail worth a read syscall.
const MIN_READ_SIZE: usize = 4096;
const DEFAULT_CAPACITY: usize = 1 << 20;
/// Hard cap on buffer growth. A line this long means the peer is broken.
const MAX_CAPACITY: usize = 512 << 20;

/// Line oriented read buffer over a non-blocking descriptor.
///
/// `[begin, end)` is live data, `[end, capacity)` is writable. Returned lines are mutable,
/// so callers may decode escapes in place.
pub struct RollingBuffer {
    buf: Vec<u8>,
    begin: usize,
    end: usize,
}

impl Default for RollingBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl RollingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(2 * MIN_READ_SIZE)],
            begin: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of buffered but not yet returned bytes.
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Tell whether a whole line is buffered.
    pub fn has_line(&self) -> bool {
        self.buf[self.begin..self.end].contains(&b'\n')
    }

    /// Return next line including its trailing newline, `None` if no complete line is
    /// available after a single read attempt.
    pub fn read_line(&mut self, input: &InputDescriptor) -> Result<Option<&mut [u8]>, Error> {
        if let Some(pos) = self.find_newline(self.begin) {
            return Ok(Some(self.take_line(pos)));
        }

        self.reserve_for_read();
        let tail = self.end;
        let n = input.read_once(&mut self.buf[tail..])?;
        self.end += n;

        match self.find_newline(tail) {
            Some(pos) => Ok(Some(self.take_line(pos))),
            None => Ok(None),
        }
    }

    /// Wait until a line may be read without blocking.
    pub fn wait_for_line(&self, input: &InputDescriptor, timeout: Duration) -> Result<bool, Error> {
        if self.has_line() {
            return Ok(true);
        }
        input.wait_for_input(timeout)
    }

    fn find_newline(&self, from: usize) -> Option<usize> {
        self.buf[from..self.end]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| from + pos)
    }

    fn take_line(&mut self, newline: usize) -> &mut [u8] {
        let start = self.begin;
        self.begin = newline + 1;
        &mut self.buf[start..=newline]
    }

    fn reserve_for_read(&mut self) {
        if self.begin == self.end {
            self.begin = 0;
            self.end = 0;
        }
        if self.buf.len() - self.end >= MIN_READ_SIZE {
            return;
        }

        let used = self.end - self.begin;
        if self.begin >= used {
            self.buf.copy_within(self.begin..self.end, 0);
            self.begin = 0;
            self.end = used;
            return;
        }

        let capacity = (self.buf.len() + self.buf.len() / 2).max(used + MIN_READ_SIZE);
        if capacity > MAX_CAPACITY {
            fatal!("Rolling buffer exceeds {MAX_CAPACITY} bytes");
        }
        log::debug!(target: "io", "rolling buffer grows to {capacity} bytes");
        self.buf.resize(capacity, 0);
    }
}
