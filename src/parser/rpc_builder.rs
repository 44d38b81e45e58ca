use crate::{fatal, pdp_assert};
use bytes::{BufMut, BytesMut};

/// Nesting limit, the outer request array included.
pub const MAX_DEPTH: usize = 8;
const MAX_SHORT_LEN: u32 = 15;
/// Position of the token type byte inside a request.
const TOKEN_POS: usize = 2;
/// Token used until the real one is known, always encoded as uint32.
pub const PLACEHOLDER_TOKEN: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, Default)]
struct Backfill {
    pos: usize,
    elements: u32,
}

/// Argument of an outbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcArg<'a> {
    Nil,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Str(&'a str),
    Bytes(&'a [u8]),
    Array(Vec<RpcArg<'a>>),
    Map(Vec<(RpcArg<'a>, RpcArg<'a>)>),
}

impl From<bool> for RpcArg<'_> {
    fn from(value: bool) -> Self {
        RpcArg::Bool(value)
    }
}

impl From<i64> for RpcArg<'_> {
    fn from(value: i64) -> Self {
        RpcArg::Int(value)
    }
}

impl From<i32> for RpcArg<'_> {
    fn from(value: i32) -> Self {
        RpcArg::Int(value as i64)
    }
}

impl From<u32> for RpcArg<'_> {
    fn from(value: u32) -> Self {
        RpcArg::Uint(value as u64)
    }
}

impl From<u64> for RpcArg<'_> {
    fn from(value: u64) -> Self {
        RpcArg::Uint(value)
    }
}

impl<'a> From<&'a str> for RpcArg<'a> {
    fn from(value: &'a str) -> Self {
        RpcArg::Str(value)
    }
}

impl<'a> From<&'a String> for RpcArg<'a> {
    fn from(value: &'a String) -> Self {
        RpcArg::Str(value.as_str())
    }
}

impl<'a> From<&'a [u8]> for RpcArg<'a> {
    fn from(value: &'a [u8]) -> Self {
        RpcArg::Bytes(value)
    }
}

impl<'a, T: Into<RpcArg<'a>>> From<Vec<T>> for RpcArg<'a> {
    fn from(value: Vec<T>) -> Self {
        RpcArg::Array(value.into_iter().map(Into::into).collect())
    }
}

/// Builder of one msgpack-RPC request frame `[0, token, method, [args...]]`.
///
/// Arrays and maps are short (fixarray/fixmap): the header byte is written on open and
/// backpatched with the element count on close.
pub struct RpcBuilder {
    buf: BytesMut,
    backfill: [Backfill; MAX_DEPTH],
    depth: usize,
}

impl RpcBuilder {
    pub fn new(token: u32, method: &str) -> Self {
        let mut builder = Self {
            buf: BytesMut::with_capacity(256),
            backfill: [Backfill::default(); MAX_DEPTH],
            depth: 0,
        };
        builder.restart(token, method);
        builder
    }

    /// Builder whose token is assigned later with [`RpcBuilder::set_token`].
    pub fn with_placeholder(method: &str) -> Self {
        Self::new(PLACEHOLDER_TOKEN, method)
    }

    /// Drop the current frame and start a new one, the buffer is reused.
    pub fn restart(&mut self, token: u32, method: &str) {
        self.buf.clear();
        self.depth = 0;
        // the request type is counted right away
        self.backfill[0] = Backfill {
            pos: 0,
            elements: 1,
        };
        self.buf.put_u8(0x90);
        self.buf.put_u8(0x00);
        self.add_unsigned(token as u64);
        self.add_str(method);
    }

    /// Overwrite the token of a frame started with a placeholder.
    pub fn set_token(&mut self, token: u32) -> bool {
        if self.buf.get(TOKEN_POS) != Some(&0xce) {
            return false;
        }
        self.buf[TOKEN_POS + 1..TOKEN_POS + 5].copy_from_slice(&token.to_be_bytes());
        true
    }

    #[inline(always)]
    fn on_element_added(&mut self) {
        self.backfill[self.depth].elements += 1;
    }

    pub fn add_unsigned(&mut self, value: u64) {
        if value <= 0x7f {
            self.buf.put_u8(value as u8);
        } else if value <= u8::MAX as u64 {
            self.buf.put_u8(0xcc);
            self.buf.put_u8(value as u8);
        } else if value <= u16::MAX as u64 {
            self.buf.put_u8(0xcd);
            self.buf.put_u16(value as u16);
        } else if value <= u32::MAX as u64 {
            self.buf.put_u8(0xce);
            self.buf.put_u32(value as u32);
        } else {
            self.buf.put_u8(0xcf);
            self.buf.put_u64(value);
        }
        self.on_element_added();
    }

    pub fn add_integer(&mut self, value: i64) {
        if value >= 0 {
            return self.add_unsigned(value as u64);
        }

        if value >= -32 {
            self.buf.put_i8(value as i8);
        } else if value >= i8::MIN as i64 {
            self.buf.put_u8(0xd0);
            self.buf.put_i8(value as i8);
        } else if value >= i16::MIN as i64 {
            self.buf.put_u8(0xd1);
            self.buf.put_i16(value as i16);
        } else if value >= i32::MIN as i64 {
            self.buf.put_u8(0xd2);
            self.buf.put_i32(value as i32);
        } else {
            self.buf.put_u8(0xd3);
            self.buf.put_i64(value);
        }
        self.on_element_added();
    }

    pub fn add_bool(&mut self, value: bool) {
        self.buf.put_u8(if value { 0xc3 } else { 0xc2 });
        self.on_element_added();
    }

    pub fn add_nil(&mut self) {
        self.buf.put_u8(0xc0);
        self.on_element_added();
    }

    /// Append a string header and return the payload region for the caller to fill.
    pub fn add_uninitialized_string(&mut self, len: usize) -> &mut [u8] {
        if len < 32 {
            self.buf.put_u8(0xa0 | len as u8);
        } else if len <= u8::MAX as usize {
            self.buf.put_u8(0xd9);
            self.buf.put_u8(len as u8);
        } else if len <= u16::MAX as usize {
            self.buf.put_u8(0xda);
            self.buf.put_u16(len as u16);
        } else if len <= u32::MAX as usize {
            self.buf.put_u8(0xdb);
            self.buf.put_u32(len as u32);
        } else {
            fatal!("RpcBuilder: string overflow ({len} bytes)");
        }
        self.on_element_added();

        let start = self.buf.len();
        self.buf.resize(start + len, 0);
        &mut self.buf[start..]
    }

    pub fn add_bytes(&mut self, value: &[u8]) {
        self.add_uninitialized_string(value.len())
            .copy_from_slice(value);
    }

    pub fn add_str(&mut self, value: &str) {
        self.add_bytes(value.as_bytes());
    }

    pub fn add(&mut self, arg: &RpcArg) {
        match arg {
            RpcArg::Nil => self.add_nil(),
            RpcArg::Bool(value) => self.add_bool(*value),
            RpcArg::Int(value) => self.add_integer(*value),
            RpcArg::Uint(value) => self.add_unsigned(*value),
            RpcArg::Str(value) => self.add_str(value),
            RpcArg::Bytes(value) => self.add_bytes(value),
            RpcArg::Array(elements) => {
                self.open_array();
                elements.iter().for_each(|e| self.add(e));
                self.close_array();
            }
            RpcArg::Map(pairs) => {
                self.open_map();
                for (key, value) in pairs {
                    self.add(key);
                    self.add(value);
                }
                self.close_map();
            }
        }
    }

    fn open(&mut self, header: u8) {
        self.on_element_added();
        if self.depth + 1 == MAX_DEPTH {
            fatal!("RpcBuilder: depth overflow!");
        }
        self.depth += 1;
        self.backfill[self.depth] = Backfill {
            pos: self.buf.len(),
            elements: 0,
        };
        self.buf.put_u8(header);
    }

    pub fn open_array(&mut self) {
        self.open(0x90);
    }

    pub fn close_array(&mut self) {
        if self.depth == 0 {
            fatal!("RpcBuilder: closing array which has not been opened!");
        }
        let Backfill { pos, elements } = self.backfill[self.depth];
        if elements > MAX_SHORT_LEN {
            fatal!("RpcBuilder: too many elements for array ({elements})!");
        }
        self.buf[pos] = 0x90 | elements as u8;
        self.depth -= 1;
    }

    pub fn open_map(&mut self) {
        self.open(0x80);
    }

    pub fn close_map(&mut self) {
        if self.depth == 0 {
            fatal!("RpcBuilder: closing map which has not been opened!");
        }
        let Backfill { pos, elements } = self.backfill[self.depth];
        if elements % 2 == 1 {
            fatal!("RpcBuilder: odd number of elements for map!");
        }
        let pairs = elements / 2;
        if pairs > MAX_SHORT_LEN {
            fatal!("RpcBuilder: too many elements for map ({pairs})!");
        }
        self.buf[pos] = 0x80 | pairs as u8;
        self.depth -= 1;
    }

    /// Complete the frame and return its bytes.
    pub fn finish(&mut self) -> &[u8] {
        if self.depth != 0 {
            fatal!("RpcBuilder: unclosed array!");
        }
        let elements = self.backfill[0].elements;
        pdp_assert!(elements == 4, "RpcBuilder: request has {elements} elements");
        self.buf[0] = 0x90 | elements as u8;
        &self.buf
    }
}
