use crate::expr::{align_up, NodeRef};
use crate::fatal;
use bytes::{Bytes, BytesMut};

pub const CHUNK_SIZE: usize = 64 << 10;
pub const MAX_CAPACITY: usize = 1 << 30;

/// Multi-chunk bump allocator for payloads whose size is not known in advance.
///
/// Small requests bump inside the current chunk, a request that does not fit opens a fresh
/// chunk. Requests of at least [`CHUNK_SIZE`] get a dedicated block and leave the current
/// chunk in place.
#[derive(Default)]
pub struct ChunkArray {
    chunks: Vec<BytesMut>,
    current: Option<usize>,
    head: usize,
    total: usize,
}

impl ChunkArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total bytes reserved by chunks and large blocks.
    pub fn total_capacity(&self) -> usize {
        self.total
    }

    pub fn allocate(&mut self, bytes: usize) -> NodeRef {
        let size = align_up(bytes);

        if size >= CHUNK_SIZE {
            self.reserve(size);
            self.chunks.push(BytesMut::zeroed(size));
            return NodeRef::new(self.chunks.len() - 1, 0);
        }

        let current = match self.current {
            Some(current) if self.head + size <= CHUNK_SIZE => current,
            _ => {
                self.reserve(CHUNK_SIZE);
                self.chunks.push(BytesMut::zeroed(CHUNK_SIZE));
                self.head = 0;
                self.current = Some(self.chunks.len() - 1);
                self.chunks.len() - 1
            }
        };
        let offset = self.head;
        self.head += size;
        NodeRef::new(current, offset)
    }

    pub fn region_mut(&mut self, at: NodeRef, len: usize) -> &mut [u8] {
        let offset = at.offset as usize;
        &mut self.chunks[at.chunk as usize][offset..offset + len]
    }

    /// Hand every chunk out, the allocator starts from scratch afterwards.
    pub fn release_chunks(&mut self) -> Vec<Bytes> {
        self.current = None;
        self.head = 0;
        self.total = 0;
        self.chunks.drain(..).map(BytesMut::freeze).collect()
    }

    fn reserve(&mut self, size: usize) {
        if self.total + size > MAX_CAPACITY {
            fatal!("Chunk array exceeds {MAX_CAPACITY} bytes");
        }
        self.total += size;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expr::ALIGNMENT;

    #[test]
    fn test_small_requests_share_chunk() {
        let mut chunks = ChunkArray::new();
        let a = chunks.allocate(3);
        let b = chunks.allocate(17);
        assert_eq!(a, NodeRef::new(0, 0));
        assert_eq!(b, NodeRef::new(0, 8));
        assert_eq!(b.offset as usize % ALIGNMENT, 0);
        assert_eq!(chunks.chunk_count(), 1);
    }

    #[test]
    fn test_overflow_opens_new_chunk() {
        let mut chunks = ChunkArray::new();
        chunks.allocate(CHUNK_SIZE - 16);
        let next = chunks.allocate(32);
        assert_eq!(next, NodeRef::new(1, 0));
        // the partially used chunk is not revisited
        let small = chunks.allocate(8);
        assert_eq!(small, NodeRef::new(1, 32));
    }

    #[test]
    fn test_large_block_keeps_current_chunk() {
        let mut chunks = ChunkArray::new();
        chunks.allocate(16);
        let large = chunks.allocate(CHUNK_SIZE * 2);
        assert_eq!(large, NodeRef::new(1, 0));
        let small = chunks.allocate(8);
        assert_eq!(small, NodeRef::new(0, 16));
        assert_eq!(chunks.total_capacity(), CHUNK_SIZE * 3);
    }

    #[test]
    fn test_release_chunks() {
        let mut chunks = ChunkArray::new();
        let at = chunks.allocate(4);
        chunks.region_mut(at, 4).copy_from_slice(b"abcd");
        let released = chunks.release_chunks();
        assert_eq!(released.len(), 1);
        assert_eq!(&released[0][..4], b"abcd");
        assert_eq!(chunks.chunk_count(), 0);
        assert_eq!(chunks.allocate(8), NodeRef::new(0, 0));
    }
}
