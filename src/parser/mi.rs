//! Two-pass GDB/MI result parser.
//!
//! The payload of a result or async record (`name=value,...`) is walked twice by the same
//! syntax walker. [`MiFirstPass`] measures: it counts children and key bytes of every
//! composite and accumulates the exact arena footprint. [`MiSecondPass`] allocates an arena of
//! that size and materializes the tree, consuming the size records in opening order.
//!
//! Names inside lists (`stack=[frame={...},frame={...}]`) are dropped, only values are kept.

use crate::error::Error;
use crate::expr::arena::Arena;
use crate::expr::hash::KeyHash;
use crate::expr::{
    align_up, encode, list_node_size, string_node_size, tuple_node_size, ExprKind, ExprTree,
    NodeRef, HEADER_SIZE,
};
use crate::pdp_assert;
use smallvec::{smallvec, SmallVec};

/// Longest excerpt of the input quoted in error messages.
const CONTEXT_LEN: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Composite {
    Tuple,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SizeRecord {
    kind: Composite,
    elements: u32,
    key_bytes: u32,
}

struct SyntaxError {
    what: &'static str,
    pos: usize,
}

trait Sink {
    fn open(&mut self, kind: Composite);
    fn key(&mut self, name: &[u8]);
    fn string(&mut self, body: &[u8]);
    fn close(&mut self);
}

#[inline(always)]
fn is_identifier(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b'-'
}

#[inline(always)]
fn decode_escape(b: u8) -> u8 {
    match b {
        // carriage return decodes to a newline as well
        b'n' | b'r' => b'\n',
        b't' => b' ',
        other => other,
    }
}

/// Length of a c-string body after escape decoding.
fn unescaped_len(body: &[u8]) -> usize {
    let mut len = 0;
    let mut i = 0;
    while i < body.len() {
        i += if body[i] == b'\\' { 2 } else { 1 };
        len += 1;
    }
    len
}

/// Decode c-string `body` into `out`, returns number of written bytes.
fn unescape_into(body: &[u8], out: &mut [u8]) -> usize {
    let (mut i, mut j) = (0, 0);
    while i < body.len() {
        if body[i] == b'\\' && i + 1 < body.len() {
            out[j] = decode_escape(body[i + 1]);
            i += 2;
        } else {
            out[j] = body[i];
            i += 1;
        }
        j += 1;
    }
    j
}

/// Decode a quoted c-string in place. `buf` must start with a quote.
/// Returns the length of decoded content placed at the start of `buf`.
pub fn unescape_in_place(buf: &mut [u8]) -> Option<usize> {
    let end = scan_cstring(buf, 0).ok()?;
    let (mut i, mut j) = (1, 0);
    while i < end {
        if buf[i] == b'\\' {
            buf[j] = decode_escape(buf[i + 1]);
            i += 2;
        } else {
            buf[j] = buf[i];
            i += 1;
        }
        j += 1;
    }
    Some(j)
}

/// Return position of the closing quote of a c-string that opens at `start`.
fn scan_cstring(input: &[u8], start: usize) -> Result<usize, SyntaxError> {
    let mut pos = start + 1;
    while pos < input.len() {
        match input[pos] {
            b'"' => return Ok(pos),
            b'\\' => pos += 2,
            _ => pos += 1,
        }
    }
    Err(SyntaxError {
        what: "Unterminated c-string!",
        pos: start,
    })
}

enum State {
    Item,
    Value,
    AfterValue,
}

/// Walk MI results, reporting structure into `sink`.
fn walk<S: Sink>(input: &[u8], sink: &mut S) -> Result<(), SyntaxError> {
    let mut stack: SmallVec<[Composite; 16]> = smallvec![Composite::Tuple];
    sink.open(Composite::Tuple);
    if input.is_empty() {
        sink.close();
        return Ok(());
    }

    let mut pos = 0;
    let mut state = State::Item;
    loop {
        let top = stack[stack.len() - 1];
        match state {
            State::Item => {
                let name_len = input[pos..].iter().take_while(|&&b| is_identifier(b)).count();
                if top == Composite::Tuple || name_len > 0 {
                    let name_end = pos + name_len;
                    if name_len == 0 || input.get(name_end) != Some(&b'=') {
                        return Err(SyntaxError {
                            what: "Expecting variable=...",
                            pos,
                        });
                    }
                    if top == Composite::Tuple {
                        sink.key(&input[pos..name_end]);
                    }
                    pos = name_end + 1;
                }
                state = State::Value;
            }
            State::Value => match input.get(pos) {
                None => {
                    return Err(SyntaxError {
                        what: "Expecting value but got empty string",
                        pos,
                    })
                }
                Some(b'"') => {
                    let end = scan_cstring(input, pos)?;
                    sink.string(&input[pos + 1..end]);
                    pos = end + 1;
                    state = State::AfterValue;
                }
                Some(&bracket @ (b'{' | b'[')) => {
                    let (kind, closing) = if bracket == b'{' {
                        (Composite::Tuple, b'}')
                    } else {
                        (Composite::List, b']')
                    };
                    sink.open(kind);
                    pos += 1;
                    if input.get(pos) == Some(&closing) {
                        pos += 1;
                        sink.close();
                        state = State::AfterValue;
                    } else {
                        stack.push(kind);
                        state = State::Item;
                    }
                }
                Some(_) => {
                    return Err(SyntaxError {
                        what: "Expecting value but got invalid first char",
                        pos,
                    })
                }
            },
            State::AfterValue => match input.get(pos) {
                None if stack.len() == 1 => {
                    sink.close();
                    return Ok(());
                }
                None => {
                    return Err(SyntaxError {
                        what: "Unexpected end of input: unclosed list or tuple",
                        pos,
                    })
                }
                Some(b',') => {
                    pos += 1;
                    state = State::Item;
                }
                Some(&bracket @ (b'}' | b']')) => {
                    if stack.len() == 1 {
                        return Err(SyntaxError {
                            what: "Syntax error, extra closing bracket",
                            pos,
                        });
                    }
                    let expected = if top == Composite::Tuple { b'}' } else { b']' };
                    if bracket != expected {
                        return Err(SyntaxError {
                            what: "No open list/tuple in scope",
                            pos,
                        });
                    }
                    stack.pop();
                    sink.close();
                    pos += 1;
                }
                Some(_) => {
                    return Err(SyntaxError {
                        what: "Expecting ',' or a closing bracket",
                        pos,
                    })
                }
            },
        }
    }
}

fn syntax_error(input: &[u8], err: SyntaxError) -> Error {
    let end = (err.pos + CONTEXT_LEN).min(input.len());
    let context = String::from_utf8_lossy(&input[err.pos.min(end)..end]);
    Error::MiParse(format!("{} (at {}: `{context}`)", err.what, err.pos))
}

/// Sizing pass.
pub struct MiFirstPass<'a> {
    input: &'a [u8],
    records: Vec<SizeRecord>,
    open: SmallVec<[usize; 16]>,
    total_bytes: usize,
}

impl<'a> MiFirstPass<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            records: vec![],
            open: smallvec![],
            total_bytes: 0,
        }
    }

    pub fn parse(&mut self) -> Result<(), Error> {
        let input = self.input;
        self.records.clear();
        self.open.clear();
        self.total_bytes = 0;
        walk(input, self).map_err(|e| syntax_error(input, e))
    }

    /// Exact arena size required by the second pass.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Number of composites including the root tuple.
    pub fn composites(&self) -> usize {
        self.records.len()
    }
}

impl Sink for MiFirstPass<'_> {
    fn open(&mut self, kind: Composite) {
        if let Some(&parent) = self.open.last() {
            self.records[parent].elements += 1;
        }
        self.open.push(self.records.len());
        self.records.push(SizeRecord {
            kind,
            elements: 0,
            key_bytes: 0,
        });
    }

    fn key(&mut self, name: &[u8]) {
        if let Some(&top) = self.open.last() {
            self.records[top].key_bytes += name.len() as u32 + 1;
        }
    }

    fn string(&mut self, body: &[u8]) {
        if let Some(&top) = self.open.last() {
            self.records[top].elements += 1;
        }
        self.total_bytes += string_node_size(unescaped_len(body));
    }

    fn close(&mut self) {
        let Some(idx) = self.open.pop() else {
            return;
        };
        let record = self.records[idx];
        let n = record.elements as usize;
        self.total_bytes += match record.kind {
            Composite::Tuple => tuple_node_size(n) + align_up(record.key_bytes as usize),
            Composite::List => list_node_size(n),
        };
    }
}

struct Construct {
    record: SizeRecord,
    node: u32,
    index: usize,
    key_table: u32,
    key_pos: usize,
    pending_key: (usize, usize),
}

/// Materialization pass, driven by the size records of a successful [`MiFirstPass`].
pub struct MiSecondPass<'a, 'p> {
    input: &'a [u8],
    first: &'p MiFirstPass<'a>,
    arena: Arena,
    next_record: usize,
    stack: SmallVec<[Construct; 16]>,
    root: Option<u32>,
}

impl<'a, 'p> MiSecondPass<'a, 'p> {
    pub fn new(input: &'a [u8], first: &'p MiFirstPass<'a>) -> Self {
        Self {
            input,
            first,
            arena: Arena::with_capacity(first.total_bytes()),
            next_record: 0,
            stack: smallvec![],
            root: None,
        }
    }

    pub fn parse(mut self) -> Result<ExprTree, Error> {
        let input = self.input;
        walk(input, &mut self).map_err(|e| syntax_error(input, e))?;
        pdp_assert!(
            self.next_record == self.first.records.len(),
            "Size records left after second pass: {} of {}",
            self.next_record,
            self.first.records.len()
        );
        pdp_assert!(self.arena.used() <= self.first.total_bytes());
        let root = self.root.unwrap_or_default();
        Ok(ExprTree::new(
            vec![self.arena.finish()],
            NodeRef::new(0, root as usize),
        ))
    }

    /// Attach a finished child to the composite on top of the stack.
    fn bolt(&mut self, child: u32) {
        let Some(parent) = self.stack.last_mut() else {
            return;
        };
        let n = parent.record.elements as usize;
        pdp_assert!(
            parent.index < n,
            "Composite overflows its measured size of {n}"
        );
        let child = NodeRef::new(0, child as usize);
        let (index, node, pending_key) = (parent.index, parent.node, parent.pending_key);
        parent.index += 1;

        match parent.record.kind {
            Composite::Tuple => {
                let region = self.arena.region_mut(node, tuple_node_size(n));
                encode::tuple_record(region, n, index, pending_key.0, pending_key.1, child);
            }
            Composite::List => {
                let region = self.arena.region_mut(node, list_node_size(n));
                encode::list_child(region, index, child);
            }
        }
    }
}

impl Sink for MiSecondPass<'_, '_> {
    fn open(&mut self, kind: Composite) {
        let Some(&record) = self.first.records.get(self.next_record) else {
            crate::fatal!("Second pass runs out of size records");
        };
        pdp_assert!(record.kind == kind, "Size record kind mismatch");
        self.next_record += 1;

        let n = record.elements as usize;
        let (node, key_table) = match kind {
            Composite::Tuple => {
                let node = self.arena.allocate(tuple_node_size(n));
                let key_table = self
                    .arena
                    .allocate_or_null(record.key_bytes as usize)
                    .unwrap_or_default();
                encode::header(
                    self.arena.region_mut(node, tuple_node_size(n)),
                    ExprKind::Tuple,
                    n,
                );
                (node, key_table)
            }
            Composite::List => {
                let node = self.arena.allocate(list_node_size(n));
                encode::header(
                    self.arena.region_mut(node, list_node_size(n)),
                    ExprKind::List,
                    n,
                );
                (node, 0)
            }
        };

        if self.stack.is_empty() {
            self.root = Some(node);
        } else {
            self.bolt(node);
        }
        self.stack.push(Construct {
            record,
            node,
            index: 0,
            key_table,
            key_pos: 0,
            pending_key: (0, 0),
        });
    }

    fn key(&mut self, name: &[u8]) {
        let Some(top) = self.stack.last_mut() else {
            return;
        };
        let n = top.record.elements as usize;
        let key_offset = top.key_table as usize + top.key_pos;
        let (node, index) = (top.node, top.index);
        top.pending_key = (key_offset, name.len());
        top.key_pos += name.len() + 1;
        pdp_assert!(top.key_pos <= top.record.key_bytes as usize);

        let table = self.arena.region_mut(key_offset as u32, name.len() + 1);
        table[..name.len()].copy_from_slice(name);
        table[name.len()] = 0;
        let region = self.arena.region_mut(node, tuple_node_size(n));
        encode::hash(region, index, name.key_hash32());
    }

    fn string(&mut self, body: &[u8]) {
        let len = unescaped_len(body);
        let node = self.arena.allocate(string_node_size(len));
        let region = self.arena.region_mut(node, HEADER_SIZE + len);
        encode::string_header(region, len);
        unescape_into(body, &mut region[HEADER_SIZE..]);
        self.bolt(node);
    }

    fn close(&mut self) {
        if let Some(done) = self.stack.pop() {
            pdp_assert!(
                done.index == done.record.elements as usize,
                "Composite has {} children, measured {}",
                done.index,
                done.record.elements
            );
        }
    }
}

/// Parse MI results payload. Failures are logged with a short context and yield `None`.
pub fn parse_mi(input: &[u8]) -> Option<ExprTree> {
    let mut first = MiFirstPass::new(input);
    if let Err(e) = first.parse() {
        log::error!(target: "parser", "Pass #1 failed: {e}");
        return None;
    }
    match MiSecondPass::new(input, &first).parse() {
        Ok(tree) => Some(tree),
        Err(e) => {
            log::error!(target: "parser", "Pass #2 failed: {e}");
            None
        }
    }
}
