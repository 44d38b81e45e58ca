//! Streaming msgpack parser.
//!
//! Reads exactly one top-level value per call from a [`ByteStream`] and materializes it into
//! an [`ExprTree`] backed by a [`ChunkArray`]. Payload bytes are copied straight from the
//! stream into their nodes.

use crate::error::Error;
use crate::expr::chunk_array::ChunkArray;
use crate::expr::hash::KeyHash;
use crate::expr::{
    encode, list_node_size, map_node_size, string_node_size, ExprKind, ExprTree, NodeRef,
    HEADER_SIZE, INT_NODE_SIZE, NULL_NODE_SIZE,
};
use crate::fatal;
use crate::io::byte_stream::ByteStream;
use smallvec::SmallVec;

/// A node that was just materialized.
#[derive(Clone, Copy)]
struct Value {
    at: NodeRef,
    kind: ExprKind,
    /// Integer value or string length.
    scalar: i64,
    /// Element count of a composite.
    elements: usize,
}

struct Descent {
    node: NodeRef,
    kind: ExprKind,
    elements: usize,
    slot: usize,
    remaining: usize,
}

pub struct RpcParser<'s> {
    stream: &'s mut ByteStream,
    chunks: ChunkArray,
}

impl<'s> RpcParser<'s> {
    pub fn new(stream: &'s mut ByteStream) -> Self {
        Self {
            stream,
            chunks: ChunkArray::new(),
        }
    }

    /// Parse one value, errors are logged and yield `None`.
    pub fn parse(&mut self) -> Option<ExprTree> {
        match self.try_parse() {
            Ok(tree) => Some(tree),
            Err(e) => {
                log::error!(target: "editor", "msgpack parse failed: {e}");
                None
            }
        }
    }

    pub fn try_parse(&mut self) -> Result<ExprTree, Error> {
        let mut stack: SmallVec<[Descent; 8]> = SmallVec::new();
        let root = loop {
            let value = self.read_value()?;

            let Some(parent) = stack.last_mut() else {
                if value.elements == 0 {
                    break value.at;
                }
                stack.push(Descent::open(value));
                continue;
            };
            Self::bolt(&mut self.chunks, parent, value);
            if value.elements > 0 {
                stack.push(Descent::open(value));
                continue;
            }

            while stack.last().map(|d| d.remaining == 0).unwrap_or(false) {
                let done = stack.pop();
                if stack.is_empty() {
                    if let Some(done) = done {
                        return Ok(self.finish(done.node));
                    }
                }
            }
        };
        Ok(self.finish(root))
    }

    fn finish(&mut self, root: NodeRef) -> ExprTree {
        ExprTree::new(self.chunks.release_chunks(), root)
    }

    /// Place a finished child into the next slot of its parent.
    fn bolt(chunks: &mut ChunkArray, parent: &mut Descent, child: Value) {
        let n = parent.elements;
        match parent.kind {
            ExprKind::List => {
                let region = chunks.region_mut(parent.node, list_node_size(n));
                encode::list_child(region, parent.slot, child.at);
            }
            _ if parent.slot % 2 == 0 => {
                let hash = match child.kind {
                    ExprKind::String => {
                        let len = child.scalar as usize;
                        let key = chunks.region_mut(child.at, HEADER_SIZE + len);
                        key[HEADER_SIZE..].key_hash32()
                    }
                    ExprKind::Int => child.scalar.key_hash32(),
                    kind => fatal!("Map key must be a string or an integer, got {kind}"),
                };
                let region = chunks.region_mut(parent.node, map_node_size(n));
                encode::hash(region, parent.slot / 2, hash);
                encode::map_key(region, n, parent.slot / 2, child.at);
            }
            _ => {
                let region = chunks.region_mut(parent.node, map_node_size(n));
                encode::map_value(region, n, parent.slot / 2, child.at);
            }
        }
        parent.slot += 1;
        parent.remaining -= 1;
    }

    fn scalar(&mut self, kind: ExprKind, value: i64) -> Value {
        let at = match kind {
            ExprKind::Null => {
                let at = self.chunks.allocate(NULL_NODE_SIZE);
                encode::null(self.chunks.region_mut(at, NULL_NODE_SIZE));
                at
            }
            _ => {
                let at = self.chunks.allocate(INT_NODE_SIZE);
                encode::int(self.chunks.region_mut(at, INT_NODE_SIZE), value);
                at
            }
        };
        Value {
            at,
            kind,
            scalar: value,
            elements: 0,
        }
    }

    fn int(&mut self, value: i64) -> Value {
        self.scalar(ExprKind::Int, value)
    }

    fn string(&mut self, len: usize) -> Result<Value, Error> {
        let at = self.chunks.allocate(string_node_size(len));
        let region = self.chunks.region_mut(at, HEADER_SIZE + len);
        encode::string_header(region, len);
        self.stream.memcpy(&mut region[HEADER_SIZE..])?;
        Ok(Value {
            at,
            kind: ExprKind::String,
            scalar: len as i64,
            elements: 0,
        })
    }

    fn composite(&mut self, kind: ExprKind, elements: usize) -> Value {
        let size = match kind {
            ExprKind::List => list_node_size(elements),
            _ => map_node_size(elements),
        };
        let at = self.chunks.allocate(size);
        encode::header(self.chunks.region_mut(at, size), kind, elements);
        Value {
            at,
            kind,
            scalar: 0,
            elements,
        }
    }

    fn read_value(&mut self) -> Result<Value, Error> {
        let byte = self.stream.pop_byte()?;
        let value = match byte {
            0x00..=0x7f => self.int(byte as i64),
            0x80..=0x8f => self.composite(ExprKind::Map, (byte & 0x0f) as usize),
            0x90..=0x9f => self.composite(ExprKind::List, (byte & 0x0f) as usize),
            0xa0..=0xbf => self.string((byte & 0x1f) as usize)?,
            0xc0 => self.scalar(ExprKind::Null, 0),
            0xc2 | 0xc3 => self.int((byte & 0x01) as i64),
            0xc4 | 0xd9 => {
                let len = self.stream.pop_byte()? as usize;
                self.string(len)?
            }
            0xc5 | 0xda => {
                let len = self.stream.pop_u16()? as usize;
                self.string(len)?
            }
            0xc6 | 0xdb => {
                let len = self.stream.pop_u32()? as usize;
                self.string(len)?
            }
            0xcc => {
                let v = self.stream.pop_byte()?;
                self.int(v as i64)
            }
            0xcd => {
                let v = self.stream.pop_u16()?;
                self.int(v as i64)
            }
            0xce => {
                let v = self.stream.pop_u32()?;
                self.int(v as i64)
            }
            0xcf => {
                // wrapping, the top bit is not preserved as a magnitude
                let v = self.stream.pop_u64()?;
                self.int(v as i64)
            }
            0xd0 => {
                let v = self.stream.pop_i8()?;
                self.int(v as i64)
            }
            0xd1 => {
                let v = self.stream.pop_i16()?;
                self.int(v as i64)
            }
            0xd2 => {
                let v = self.stream.pop_i32()?;
                self.int(v as i64)
            }
            0xd3 => {
                let v = self.stream.pop_i64()?;
                self.int(v)
            }
            0xdc => {
                let n = self.stream.pop_u16()? as usize;
                self.composite(ExprKind::List, n)
            }
            0xdd => {
                let n = self.stream.pop_u32()? as usize;
                self.composite(ExprKind::List, n)
            }
            0xde => {
                let n = self.stream.pop_u16()? as usize;
                self.composite(ExprKind::Map, n)
            }
            0xdf => {
                let n = self.stream.pop_u32()? as usize;
                self.composite(ExprKind::Map, n)
            }
            0xc7..=0xc9 | 0xd4..=0xd8 => {
                let v = read_ext_integer(self.stream, byte)?;
                self.int(v)
            }
            0xe0..=0xff => self.int(byte as i8 as i64),
            other => return Err(Error::RpcParse(format!("unsupported type byte {other:#04x}"))),
        };
        Ok(value)
    }
}

/// Decode a packed msgpack integer that fills `payload` exactly.
fn decode_packed_integer(payload: &[u8]) -> Option<i64> {
    let (&byte, rest) = payload.split_first()?;
    let be = |n: usize| {
        (rest.len() == n).then(|| rest.iter().fold(0u64, |acc, &b| acc << 8 | b as u64))
    };
    match byte {
        0x00..=0x7f if rest.is_empty() => Some(byte as i64),
        0xe0..=0xff if rest.is_empty() => Some(byte as i8 as i64),
        0xcc => be(1).map(|v| v as i64),
        0xcd => be(2).map(|v| v as i64),
        0xce => be(4).map(|v| v as i64),
        0xcf => be(8).map(|v| v as i64),
        0xd0 => be(1).map(|v| v as u8 as i8 as i64),
        0xd1 => be(2).map(|v| v as u16 as i16 as i64),
        0xd2 => be(4).map(|v| v as u32 as i32 as i64),
        0xd3 => be(8).map(|v| v as i64),
        _ => None,
    }
}

/// Read an extension value whose type byte was already consumed. Editor handles (buffers,
/// windows, tabpages) are extensions wrapping an integer.
fn read_ext_integer(stream: &mut ByteStream, byte: u8) -> Result<i64, Error> {
    let len = match byte {
        0xd4 => 1,
        0xd5 => 2,
        0xd6 => 4,
        0xd7 => 8,
        0xd8 => 16,
        0xc7 => stream.pop_byte()? as usize,
        0xc8 => stream.pop_u16()? as usize,
        _ => stream.pop_u32()? as usize,
    };
    let ext_type = stream.pop_i8()?;
    let mut payload: SmallVec<[u8; 16]> = SmallVec::from_elem(0, len);
    stream.memcpy(&mut payload)?;
    decode_packed_integer(&payload).ok_or_else(|| {
        Error::RpcParse(format!("extension {ext_type} does not wrap an integer"))
    })
}

fn unexpected(what: &str, byte: u8) -> Error {
    Error::Desync(format!("expected {what}, got type byte {byte:#04x}"))
}

/// Read an integer (or an editor handle) directly from the stream.
pub fn read_integer(stream: &mut ByteStream) -> Result<i64, Error> {
    let byte = stream.pop_byte()?;
    let value = match byte {
        0x00..=0x7f => byte as i64,
        0xe0..=0xff => byte as i8 as i64,
        0xcc => stream.pop_byte()? as i64,
        0xcd => stream.pop_u16()? as i64,
        0xce => stream.pop_u32()? as i64,
        0xcf => stream.pop_u64()? as i64,
        0xd0 => stream.pop_i8()? as i64,
        0xd1 => stream.pop_i16()? as i64,
        0xd2 => stream.pop_i32()? as i64,
        0xd3 => stream.pop_i64()?,
        0xc7..=0xc9 | 0xd4..=0xd8 => read_ext_integer(stream, byte)?,
        other => return Err(unexpected("an integer", other)),
    };
    Ok(value)
}

pub fn read_bool(stream: &mut ByteStream) -> Result<bool, Error> {
    match stream.pop_byte()? {
        0xc2 => Ok(false),
        0xc3 => Ok(true),
        other => Err(unexpected("a boolean", other)),
    }
}

/// Read a string (or binary) value, invalid UTF-8 is replaced.
pub fn read_string(stream: &mut ByteStream) -> Result<String, Error> {
    let byte = stream.pop_byte()?;
    let len = match byte {
        0xa0..=0xbf => (byte & 0x1f) as usize,
        0xc4 | 0xd9 => stream.pop_byte()? as usize,
        0xc5 | 0xda => stream.pop_u16()? as usize,
        0xc6 | 0xdb => stream.pop_u32()? as usize,
        other => return Err(unexpected("a string", other)),
    };
    let mut bytes = vec![0u8; len];
    stream.memcpy(&mut bytes)?;
    Ok(match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })
}

/// Read an array header, returns the number of elements that follow.
pub fn read_array_len(stream: &mut ByteStream) -> Result<usize, Error> {
    let byte = stream.pop_byte()?;
    match byte {
        0x90..=0x9f => Ok((byte & 0x0f) as usize),
        0xdc => Ok(stream.pop_u16()? as usize),
        0xdd => Ok(stream.pop_u32()? as usize),
        other => Err(unexpected("an array", other)),
    }
}

/// Discard one complete value, composites included.
pub fn skip_value(stream: &mut ByteStream) -> Result<(), Error> {
    let mut remaining: usize = 1;
    while remaining > 0 {
        remaining -= 1;
        let byte = stream.pop_byte()?;
        match byte {
            0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => {}
            0x80..=0x8f => remaining += 2 * (byte & 0x0f) as usize,
            0x90..=0x9f => remaining += (byte & 0x0f) as usize,
            0xa0..=0xbf => stream.skip((byte & 0x1f) as usize)?,
            0xc4 | 0xd9 => {
                let len = stream.pop_byte()? as usize;
                stream.skip(len)?
            }
            0xc5 | 0xda => {
                let len = stream.pop_u16()? as usize;
                stream.skip(len)?
            }
            0xc6 | 0xdb => {
                let len = stream.pop_u32()? as usize;
                stream.skip(len)?
            }
            0xc7 => {
                let len = stream.pop_byte()? as usize;
                stream.skip(len + 1)?
            }
            0xc8 => {
                let len = stream.pop_u16()? as usize;
                stream.skip(len + 1)?
            }
            0xc9 => {
                let len = stream.pop_u32()? as usize;
                stream.skip(len + 1)?
            }
            0xcc | 0xd0 => stream.skip(1)?,
            0xcd | 0xd1 => stream.skip(2)?,
            0xca | 0xce | 0xd2 => stream.skip(4)?,
            0xcb | 0xcf | 0xd3 => stream.skip(8)?,
            0xd4 => stream.skip(2)?,
            0xd5 => stream.skip(3)?,
            0xd6 => stream.skip(5)?,
            0xd7 => stream.skip(9)?,
            0xd8 => stream.skip(17)?,
            0xdc => remaining += stream.pop_u16()? as usize,
            0xdd => remaining += stream.pop_u32()? as usize,
            0xde => remaining += 2 * stream.pop_u16()? as usize,
            0xdf => remaining += 2 * stream.pop_u32()? as usize,
            other => return Err(Error::RpcParse(format!("unsupported type byte {other:#04x}"))),
        }
    }
    Ok(())
}

impl Descent {
    fn open(value: Value) -> Self {
        let remaining = match value.kind {
            ExprKind::Map => 2 * value.elements,
            _ => value.elements,
        };
        Self {
            node: value.at,
            kind: value.kind,
            elements: value.elements,
            slot: 0,
            remaining,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::descriptor::InputDescriptor;
    use crate::parser::rpc_builder::{RpcArg, RpcBuilder};
    use std::io::Write;
    use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
    use std::time::Duration;

    fn stream(data: &[u8]) -> (ByteStream, os_pipe::PipeWriter) {
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        writer.write_all(data).unwrap();
        let fd = unsafe { OwnedFd::from_raw_fd(reader.into_raw_fd()) };
        let input = InputDescriptor::new(fd).unwrap();
        (ByteStream::new(input, Duration::from_millis(50)), writer)
    }

    #[test]
    fn test_builder_round_trip() {
        let mut builder = RpcBuilder::new(2, "set_config");
        builder.open_array();
        for arg in [
            RpcArg::Int(-42),
            RpcArg::Uint(123),
            RpcArg::Bool(true),
            RpcArg::Bool(false),
            RpcArg::Str("hello"),
        ] {
            builder.add(&arg);
        }
        builder.close_array();

        let (mut stream, _writer) = stream(builder.finish());
        let tree = RpcParser::new(&mut stream).parse().unwrap();
        let root = tree.rpc_view();
        assert_eq!(root.kind(), Some(ExprKind::List));
        assert_eq!(root.count(), 4);
        assert_eq!(root.at(0).as_int(), Some(0));
        assert_eq!(root.at(1).as_int(), Some(2));
        assert_eq!(root.at(2), "set_config");

        let args = root.at(3);
        assert_eq!(args.count(), 5);
        assert_eq!(args.at(0).as_int(), Some(-42));
        assert_eq!(args.at(1).as_int(), Some(123));
        assert_eq!(args.at(2).as_int(), Some(1));
        assert_eq!(args.at(3).as_bool(), Some(false));
        assert_eq!(args.at(4), "hello");
    }

    #[test]
    fn test_lines_event_notification() {
        let mut data = vec![0x93, 0x02, 0xb4];
        data.extend_from_slice(b"nvim_buf_lines_event");
        data.extend_from_slice(&[0x95, 0x01, 0x00, 0x0a, 0x0a, 0x92, 0xa5]);
        data.extend_from_slice(b"line1");
        data.push(0xa5);
        data.extend_from_slice(b"line2");

        let (mut stream, _writer) = stream(&data);
        let tree = RpcParser::new(&mut stream).parse().unwrap();
        let root = tree.rpc_view();
        assert_eq!(root.count(), 3);
        assert_eq!(root.at(0).as_int(), Some(2));
        assert_eq!(root.at(1), "nvim_buf_lines_event");
        let args = root.at(2);
        assert_eq!(args.count(), 5);
        assert_eq!(args.at(3).as_int(), Some(10));
        let lines = args.at(4);
        assert_eq!(lines.kind(), Some(ExprKind::List));
        assert_eq!(lines.count(), 2);
        assert_eq!(lines.at(0), "line1");
        assert_eq!(lines.at(1), "line2");
        assert_eq!(stream.buffered(), 0);
    }

    #[test]
    fn test_maps_and_wide_forms() {
        let mut data = vec![0x83, 0xa2, b'i', b'd', 0x07, 0x05, 0xc0, 0xa4];
        data.extend_from_slice(b"list");
        data.extend_from_slice(&[0xdc, 0x00, 0x02, 0xcf, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
        data.extend_from_slice(&[0xff, 0xff, 0xc4, 0x02, b'o', b'k']);

        let (mut stream, _writer) = stream(&data);
        let tree = RpcParser::new(&mut stream).parse().unwrap();
        let root = tree.rpc_view();
        assert_eq!(root.kind(), Some(ExprKind::Map));
        assert_eq!(root.count(), 3);
        assert_eq!(root.get("id").as_int(), Some(7));
        assert!(root.get_int(5).is_nil());
        let list = root.get("list");
        assert_eq!(list.at(0).as_int(), Some(-1));
        assert_eq!(list.at(1), "ok");
        assert!(!root.get("missing").is_some());
    }

    #[test]
    fn test_map_key_hashes() {
        let data = [0x82, 0xa1, b'a', 0x01, 0x2a, 0x02];
        let (mut stream, _writer) = stream(&data);
        let tree = RpcParser::new(&mut stream).parse().unwrap();
        let root = tree.root();
        for i in 0..root.size() {
            let (key, _) = root.map_entry(i).unwrap();
            let expected = match key.kind() {
                ExprKind::String => key.as_bytes().unwrap().key_hash32(),
                ExprKind::Int => key.as_int().unwrap().key_hash32(),
                kind => panic!("unexpected key kind {kind}"),
            };
            assert_eq!(root.hash_at(i), expected);
        }
    }

    #[test]
    fn test_consecutive_values() {
        let data = [0x01, 0x91, 0xa1, b'x', 0xc0];
        let (mut stream, _writer) = stream(&data);
        let mut parser = RpcParser::new(&mut stream);
        assert_eq!(parser.parse().unwrap().rpc_view().as_int(), Some(1));
        assert_eq!(parser.parse().unwrap().rpc_view().at(0), "x");
        assert!(parser.parse().unwrap().rpc_view().is_nil());
        assert!(parser.parse().is_none());
    }

    #[test]
    fn test_unknown_type_byte() {
        let (mut stream, _writer) = stream(&[0xc1]);
        let err = RpcParser::new(&mut stream).try_parse().unwrap_err();
        assert!(matches!(err, Error::RpcParse(_)));
    }

    #[test]
    fn test_editor_handles() {
        // buffer 3 as fixext1, window 1000 as ext8 wrapping uint16
        let data = [0x92, 0xd4, 0x00, 0x03, 0xc7, 0x03, 0x01, 0xcd, 0x03, 0xe8];
        let (mut stream, _writer) = stream(&data);
        let tree = RpcParser::new(&mut stream).parse().unwrap();
        assert_eq!(tree.rpc_view().at(0).as_int(), Some(3));
        assert_eq!(tree.rpc_view().at(1).as_int(), Some(1000));
    }

    #[test]
    fn test_typed_reads() {
        let mut data = vec![0xd1, 0xff, 0x38, 0xc3, 0xa3, b'a', b'b', b'c', 0x93];
        // skipped: {"k": [1, "xy", nil]}, fixext4
        data.extend_from_slice(&[0x81, 0xa1, b'k', 0x93, 0x01, 0xa2, b'x', b'y', 0xc0]);
        data.extend_from_slice(&[0xd6, 0x00, 0xce, 0, 0, 0, 0x05, 0x2a]);

        let (mut stream, _writer) = stream(&data);
        assert_eq!(read_integer(&mut stream).unwrap(), -200);
        assert!(read_bool(&mut stream).unwrap());
        assert_eq!(read_string(&mut stream).unwrap(), "abc");
        assert_eq!(read_array_len(&mut stream).unwrap(), 3);
        skip_value(&mut stream).unwrap();
        assert_eq!(read_integer(&mut stream).unwrap(), 5);
        assert!(matches!(read_bool(&mut stream), Err(Error::Desync(_))));
    }

    #[test]
    fn test_decode_packed_integer() {
        struct TestCase {
            payload: &'static [u8],
            expected: Option<i64>,
        }
        let test_cases = [
            TestCase {
                payload: &[0x05],
                expected: Some(5),
            },
            TestCase {
                payload: &[0xff],
                expected: Some(-1),
            },
            TestCase {
                payload: &[0xd1, 0xff, 0x38],
                expected: Some(-200),
            },
            TestCase {
                payload: &[0xcd, 0x03],
                expected: None,
            },
            TestCase {
                payload: &[0x05, 0x00],
                expected: None,
            },
            TestCase {
                payload: &[],
                expected: None,
            },
        ];
        for tc in test_cases {
            assert_eq!(decode_packed_integer(tc.payload), tc.expected);
        }
    }

    #[test]
    #[should_panic(expected = "Map key must be")]
    fn test_invalid_map_key() {
        let (mut stream, _writer) = stream(&[0x81, 0x90, 0x01]);
        RpcParser::new(&mut stream).parse();
    }
}
