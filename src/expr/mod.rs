//! Expression tree shared by GDB/MI and msgpack parsers.
//!
//! Nodes are encoded into 8-byte aligned regions owned by the tree. Every node starts with an
//! 8 byte header (kind byte, three padding bytes, little-endian `u32` size) followed by its
//! payload:
//!
//! | Kind   | Payload                                                                  |
//! |--------|--------------------------------------------------------------------------|
//! | null   | -                                                                        |
//! | int    | `i64`                                                                    |
//! | string | `size` bytes, no terminator                                              |
//! | list   | `size` × [`NodeRef`]                                                     |
//! | tuple  | `size` × `u32` hash (aligned), `size` × {`u32` key offset, `u32` key len, [`NodeRef`] value} |
//! | map    | `size` × `u32` hash (aligned), `size` × {[`NodeRef`] key, [`NodeRef`] value} |
//!
//! Tuple keys live in a null-terminated key table placed right after the tuple node.

pub mod arena;
pub mod chunk_array;
pub mod hash;
pub mod view;

use crate::expr::hash::KeyHash;
use bytes::Bytes;
use std::fmt;
use strum_macros::{Display, IntoStaticStr};

pub const ALIGNMENT: usize = 8;
pub const HEADER_SIZE: usize = 8;
pub const REF_SIZE: usize = 8;
/// Key offset, key length and value reference of a tuple record.
pub const RECORD_SIZE: usize = 8 + REF_SIZE;
pub const PAIR_SIZE: usize = 2 * REF_SIZE;
pub const NULL_NODE_SIZE: usize = HEADER_SIZE;
pub const INT_NODE_SIZE: usize = HEADER_SIZE + 8;

#[inline(always)]
pub const fn align_up(n: usize) -> usize {
    (n + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

pub const fn string_node_size(len: usize) -> usize {
    align_up(HEADER_SIZE + len)
}

pub const fn list_node_size(n: usize) -> usize {
    align_up(HEADER_SIZE + n * REF_SIZE)
}

/// Size of a tuple node without its key table.
pub const fn tuple_node_size(n: usize) -> usize {
    align_up(HEADER_SIZE + align_up(4 * n) + n * RECORD_SIZE)
}

pub const fn map_node_size(n: usize) -> usize {
    align_up(HEADER_SIZE + align_up(4 * n) + n * PAIR_SIZE)
}

const fn records_offset(n: usize) -> usize {
    HEADER_SIZE + align_up(4 * n)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum ExprKind {
    Null = 0,
    Int = 1,
    String = 2,
    List = 3,
    Tuple = 4,
    Map = 5,
}

impl ExprKind {
    fn from_byte(byte: u8) -> ExprKind {
        match byte {
            1 => ExprKind::Int,
            2 => ExprKind::String,
            3 => ExprKind::List,
            4 => ExprKind::Tuple,
            5 => ExprKind::Map,
            _ => ExprKind::Null,
        }
    }
}

/// Location of a node: chunk index and byte offset inside the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeRef {
    pub chunk: u32,
    pub offset: u32,
}

impl NodeRef {
    pub fn new(chunk: usize, offset: usize) -> Self {
        Self {
            chunk: chunk as u32,
            offset: offset as u32,
        }
    }

    fn encode(self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.chunk.to_le_bytes());
        out[4..8].copy_from_slice(&self.offset.to_le_bytes());
    }

    fn decode(bytes: &[u8], at: usize) -> Self {
        Self {
            chunk: read_u32(bytes, at),
            offset: read_u32(bytes, at + 4),
        }
    }
}

#[inline(always)]
fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

#[inline(always)]
fn read_i64(bytes: &[u8], at: usize) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    i64::from_le_bytes(buf)
}

/// Encoders for node regions. Every function writes into a region of the exact node size.
pub mod encode {
    use super::*;

    pub fn header(node: &mut [u8], kind: ExprKind, size: usize) {
        node[0] = kind as u8;
        node[4..8].copy_from_slice(&(size as u32).to_le_bytes());
    }

    pub fn null(node: &mut [u8]) {
        header(node, ExprKind::Null, 0);
    }

    pub fn int(node: &mut [u8], value: i64) {
        header(node, ExprKind::Int, 0);
        node[HEADER_SIZE..HEADER_SIZE + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Write string header, payload is copied by the caller into `node[HEADER_SIZE..]`.
    pub fn string_header(node: &mut [u8], len: usize) {
        header(node, ExprKind::String, len);
    }

    pub fn list_child(node: &mut [u8], index: usize, child: NodeRef) {
        let at = HEADER_SIZE + index * REF_SIZE;
        child.encode(&mut node[at..at + REF_SIZE]);
    }

    pub fn hash(node: &mut [u8], index: usize, hash: u32) {
        let at = HEADER_SIZE + index * 4;
        node[at..at + 4].copy_from_slice(&hash.to_le_bytes());
    }

    pub fn tuple_record(
        node: &mut [u8],
        n: usize,
        index: usize,
        key_offset: usize,
        key_len: usize,
        value: NodeRef,
    ) {
        let at = records_offset(n) + index * RECORD_SIZE;
        node[at..at + 4].copy_from_slice(&(key_offset as u32).to_le_bytes());
        node[at + 4..at + 8].copy_from_slice(&(key_len as u32).to_le_bytes());
        value.encode(&mut node[at + 8..at + 16]);
    }

    pub fn map_key(node: &mut [u8], n: usize, index: usize, key: NodeRef) {
        let at = records_offset(n) + index * PAIR_SIZE;
        key.encode(&mut node[at..at + REF_SIZE]);
    }

    pub fn map_value(node: &mut [u8], n: usize, index: usize, value: NodeRef) {
        let at = records_offset(n) + index * PAIR_SIZE + REF_SIZE;
        value.encode(&mut node[at..at + REF_SIZE]);
    }
}

/// Immutable expression tree, owns every region its nodes live in.
#[derive(Clone)]
pub struct ExprTree {
    chunks: Vec<Bytes>,
    root: NodeRef,
}

impl ExprTree {
    pub fn new(chunks: Vec<Bytes>, root: NodeRef) -> Self {
        Self { chunks, root }
    }

    pub fn root(&self) -> Node<'_> {
        Node::new(&self.chunks, self.root)
    }

    /// Loose view, numbers may arrive as strings.
    pub fn gdb_view(&self) -> view::GdbExprView<'_> {
        view::GdbExprView::new(Some(self.root()))
    }

    /// Strict view, kinds must match exactly.
    pub fn rpc_view(&self) -> view::RpcExprView<'_> {
        view::RpcExprView::new(Some(self.root()))
    }

    /// Total bytes held by the tree regions.
    pub fn footprint(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }
}

impl fmt::Debug for ExprTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root())
    }
}

impl PartialEq for ExprTree {
    fn eq(&self, other: &Self) -> bool {
        self.root() == other.root()
    }
}

/// Decoded handle of a single node.
#[derive(Clone, Copy)]
pub struct Node<'t> {
    chunks: &'t [Bytes],
    chunk: &'t [u8],
    offset: usize,
}

impl<'t> Node<'t> {
    fn new(chunks: &'t [Bytes], at: NodeRef) -> Self {
        Self {
            chunks,
            chunk: &chunks[at.chunk as usize],
            offset: at.offset as usize,
        }
    }

    pub fn kind(&self) -> ExprKind {
        ExprKind::from_byte(self.chunk[self.offset])
    }

    /// Payload length for strings, number of elements for composites, zero otherwise.
    pub fn size(&self) -> usize {
        read_u32(self.chunk, self.offset + 4) as usize
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.kind() {
            ExprKind::Int => Some(read_i64(self.chunk, self.offset + HEADER_SIZE)),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'t [u8]> {
        match self.kind() {
            ExprKind::String => {
                let start = self.offset + HEADER_SIZE;
                Some(&self.chunk[start..start + self.size()])
            }
            _ => None,
        }
    }

    /// List element.
    pub fn child(&self, index: usize) -> Option<Node<'t>> {
        if self.kind() != ExprKind::List || index >= self.size() {
            return None;
        }
        let at = NodeRef::decode(self.chunk, self.offset + HEADER_SIZE + index * REF_SIZE);
        Some(Node::new(self.chunks, at))
    }

    /// Stored key hash of a tuple or map entry.
    pub fn hash_at(&self, index: usize) -> u32 {
        read_u32(self.chunk, self.offset + HEADER_SIZE + index * 4)
    }

    /// Key and value of a tuple record.
    pub fn tuple_entry(&self, index: usize) -> Option<(&'t [u8], Node<'t>)> {
        if self.kind() != ExprKind::Tuple || index >= self.size() {
            return None;
        }
        let at = self.offset + records_offset(self.size()) + index * RECORD_SIZE;
        let key_offset = read_u32(self.chunk, at) as usize;
        let key_len = read_u32(self.chunk, at + 4) as usize;
        let value = NodeRef::decode(self.chunk, at + 8);
        Some((
            &self.chunk[key_offset..key_offset + key_len],
            Node::new(self.chunks, value),
        ))
    }

    /// Key and value of a map pair.
    pub fn map_entry(&self, index: usize) -> Option<(Node<'t>, Node<'t>)> {
        if self.kind() != ExprKind::Map || index >= self.size() {
            return None;
        }
        let at = self.offset + records_offset(self.size()) + index * PAIR_SIZE;
        let key = NodeRef::decode(self.chunk, at);
        let value = NodeRef::decode(self.chunk, at + REF_SIZE);
        Some((Node::new(self.chunks, key), Node::new(self.chunks, value)))
    }

    /// Find a value by string key in a tuple or map. Hashes are compared before keys.
    pub fn lookup(&self, key: &[u8]) -> Option<Node<'t>> {
        let hash = key.key_hash32();
        match self.kind() {
            ExprKind::Tuple => (0..self.size())
                .filter(|&i| self.hash_at(i) == hash)
                .filter_map(|i| self.tuple_entry(i))
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v),
            ExprKind::Map => (0..self.size())
                .filter(|&i| self.hash_at(i) == hash)
                .filter_map(|i| self.map_entry(i))
                .find(|(k, _)| k.as_bytes() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Find a value by integer key in a map.
    pub fn lookup_int(&self, key: i64) -> Option<Node<'t>> {
        if self.kind() != ExprKind::Map {
            return None;
        }
        let hash = key.key_hash32();
        (0..self.size())
            .filter(|&i| self.hash_at(i) == hash)
            .filter_map(|i| self.map_entry(i))
            .find(|(k, _)| k.as_int() == Some(key))
            .map(|(_, v)| v)
    }
}

impl PartialEq for Node<'_> {
    fn eq(&self, other: &Self) -> bool {
        if self.kind() != other.kind() || self.size() != other.size() {
            return false;
        }
        let n = self.size();
        match self.kind() {
            ExprKind::Null => true,
            ExprKind::Int => self.as_int() == other.as_int(),
            ExprKind::String => self.as_bytes() == other.as_bytes(),
            ExprKind::List => (0..n).all(|i| self.child(i) == other.child(i)),
            ExprKind::Tuple => (0..n).all(|i| self.tuple_entry(i) == other.tuple_entry(i)),
            ExprKind::Map => (0..n).all(|i| self.map_entry(i) == other.map_entry(i)),
        }
    }
}

impl fmt::Display for Node<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ExprKind::Null => f.write_str("null"),
            ExprKind::Int => write!(f, "{}", self.as_int().unwrap_or_default()),
            ExprKind::String => {
                let bytes = self.as_bytes().unwrap_or_default();
                write!(f, "\"{}\"", String::from_utf8_lossy(bytes).escape_debug())
            }
            ExprKind::List => {
                f.write_str("[")?;
                for i in 0..self.size() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    if let Some(child) = self.child(i) {
                        write!(f, "{child}")?;
                    }
                }
                f.write_str("]")
            }
            ExprKind::Tuple => {
                f.write_str("{")?;
                for i in 0..self.size() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    if let Some((key, value)) = self.tuple_entry(i) {
                        write!(f, "{}={value}", String::from_utf8_lossy(key))?;
                    }
                }
                f.write_str("}")
            }
            ExprKind::Map => {
                f.write_str("{")?;
                for i in 0..self.size() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    if let Some((key, value)) = self.map_entry(i) {
                        write!(f, "{key}: {value}")?;
                    }
                }
                f.write_str("}")
            }
        }
    }
}

impl fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
