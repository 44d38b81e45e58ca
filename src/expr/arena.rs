use crate::expr::align_up;
use crate::fatal;
use bytes::{Bytes, BytesMut};

/// Bump allocator over a single region sized by the caller.
///
/// Allocations are addressed by offsets that are multiples of [`crate::expr::ALIGNMENT`].
/// There is no individual deallocation, the whole region is released at once.
pub struct Arena {
    buf: BytesMut,
    head: usize,
}

impl Arena {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::zeroed(align_up(capacity)),
            head: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of bytes bumped so far (aligned).
    pub fn used(&self) -> usize {
        self.head
    }

    /// Allocate `bytes` rounded up to alignment, running out of space is fatal.
    pub fn allocate(&mut self, bytes: usize) -> u32 {
        let size = align_up(bytes);
        if size > self.buf.len() - self.head {
            fatal!(
                "Arena exhausted: {size} bytes requested, {} of {} left",
                self.buf.len() - self.head,
                self.buf.len()
            );
        }
        let offset = self.head;
        self.head += size;
        offset as u32
    }

    /// Same as [`Arena::allocate`] but a zero sized request yields nothing.
    pub fn allocate_or_null(&mut self, bytes: usize) -> Option<u32> {
        if bytes == 0 {
            return None;
        }
        Some(self.allocate(bytes))
    }

    /// Mutable view of an allocated region.
    pub fn region_mut(&mut self, offset: u32, len: usize) -> &mut [u8] {
        let offset = offset as usize;
        &mut self.buf[offset..offset + len]
    }

    /// Freeze the region, it becomes immutable and shareable.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}
