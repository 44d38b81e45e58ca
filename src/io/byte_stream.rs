use crate::error::Error;
use crate::io::descriptor::InputDescriptor;
use crate::{fatal, tracer};
use std::os::fd::RawFd;
use std::time::Duration;

const DEFAULT_CAPACITY: usize = 1 << 20;
/// Copies above this size bypass the scratch buffer.
const IN_PLACE_THRESHOLD: usize = 4096;

/// Binary read buffer with refill, integers are big-endian.
pub struct ByteStream {
    input: InputDescriptor,
    buf: Vec<u8>,
    begin: usize,
    end: usize,
    timeout: Duration,
}

macro_rules! pop_integer {
    ($name: ident, $ty: ty) => {
        pub fn $name(&mut self) -> Result<$ty, Error> {
            const SIZE: usize = std::mem::size_of::<$ty>();
            self.require_at_least(SIZE)?;
            let mut bytes = [0u8; SIZE];
            bytes.copy_from_slice(&self.buf[self.begin..self.begin + SIZE]);
            self.begin += SIZE;
            Ok(<$ty>::from_be_bytes(bytes))
        }
    };
}

impl ByteStream {
    pub fn new(input: InputDescriptor, timeout: Duration) -> Self {
        Self::with_capacity(input, timeout, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(input: InputDescriptor, timeout: Duration, capacity: usize) -> Self {
        Self {
            input,
            buf: vec![0; capacity.max(IN_PLACE_THRESHOLD)],
            begin: 0,
            end: 0,
            timeout,
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.input.as_raw_fd()
    }

    pub fn input(&self) -> &InputDescriptor {
        &self.input
    }

    /// Number of bytes already in memory.
    pub fn buffered(&self) -> usize {
        self.end - self.begin
    }

    /// Make at least `n` bytes available in the buffer, reading under the stream timeout.
    pub fn require_at_least(&mut self, n: usize) -> Result<(), Error> {
        let have = self.buffered();
        if have >= n {
            return Ok(());
        }
        if n > self.buf.len() {
            fatal!("Byte stream cannot hold {n} bytes (capacity {})", self.buf.len());
        }

        self.buf.copy_within(self.begin..self.end, 0);
        self.begin = 0;
        self.end = have;

        match self
            .input
            .read_at_least(&mut self.buf[have..], n - have, self.timeout)
        {
            Ok(read) => {
                self.end += read;
                Ok(())
            }
            Err(Error::Timeout(..)) if tracer::is_replaying() => {
                fatal!("Replay trace ended before {n} bytes were available")
            }
            Err(e) => Err(e),
        }
    }

    pub fn peek_byte(&mut self) -> Result<u8, Error> {
        self.require_at_least(1)?;
        Ok(self.buf[self.begin])
    }

    pub fn pop_byte(&mut self) -> Result<u8, Error> {
        let byte = self.peek_byte()?;
        self.begin += 1;
        Ok(byte)
    }

    pop_integer!(pop_u16, u16);
    pop_integer!(pop_u32, u32);
    pop_integer!(pop_u64, u64);
    pop_integer!(pop_i8, i8);
    pop_integer!(pop_i16, i16);
    pop_integer!(pop_i32, i32);
    pop_integer!(pop_i64, i64);

    /// Copy exactly `dst.len()` bytes out of the stream.
    pub fn memcpy(&mut self, dst: &mut [u8]) -> Result<(), Error> {
        let from_buffer = self.buffered().min(dst.len());
        dst[..from_buffer].copy_from_slice(&self.buf[self.begin..self.begin + from_buffer]);
        self.begin += from_buffer;

        let rest = &mut dst[from_buffer..];
        if rest.is_empty() {
            return Ok(());
        }
        if rest.len() > IN_PLACE_THRESHOLD {
            let len = rest.len();
            self.input.read_at_least(rest, len, self.timeout)?;
            return Ok(());
        }
        self.require_at_least(rest.len())?;
        rest.copy_from_slice(&self.buf[self.begin..self.begin + rest.len()]);
        self.begin += rest.len();
        Ok(())
    }

    /// Discard `n` bytes.
    pub fn skip(&mut self, mut n: usize) -> Result<(), Error> {
        loop {
            let from_buffer = self.buffered().min(n);
            self.begin += from_buffer;
            n -= from_buffer;
            if n == 0 {
                return Ok(());
            }
            self.require_at_least(n.min(self.buf.len()))?;
        }
    }
}
