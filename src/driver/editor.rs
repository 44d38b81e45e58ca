//! msgpack-RPC session with the editor.
//!
//! Requests go out through a reusable [`RpcBuilder`]. Inbound frames are either responses,
//! whose header is consumed here while the result slot is left in the stream for a typed
//! read, or notifications that are parsed whole into an [`ExprTree`].

use crate::error::Error;
use crate::expr::ExprTree;
use crate::io::byte_stream::ByteStream;
use crate::io::descriptor::{InputDescriptor, OutputDescriptor};
use crate::parser::rpc_builder::{RpcArg, RpcBuilder};
use crate::parser::rpc_parser::{self, RpcParser};
use crate::{fatal, pdp_assert};
use std::os::fd::{OwnedFd, RawFd};
use std::time::Duration;

/// Never handed out, marks "no request".
pub const INVALID_TOKEN: u32 = 0;

const RESPONSE_HEADER: u8 = 0x94;
const NOTIFICATION_HEADER: u8 = 0x93;
const NIL: u8 = 0xc0;
const MSG_RESPONSE: i64 = 1;

#[derive(Debug)]
pub enum EditorEvent {
    /// Response header was consumed, the result slot is next in the stream.
    Response(u32),
    /// A whole `[2, method, args]` frame.
    Notification(ExprTree),
}

pub struct EditorDriver {
    output: OutputDescriptor,
    input: ByteStream,
    builder: RpcBuilder,
    token: u32,
    write_timeout: Duration,
    /// Values of the current response that still have to be consumed.
    pending_values: usize,
}

impl EditorDriver {
    /// `input` carries editor to us traffic, `output` the other direction.
    pub fn new(
        input: OwnedFd,
        output: OwnedFd,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Self, Error> {
        Ok(Self {
            output: OutputDescriptor::new(output)?,
            input: ByteStream::new(InputDescriptor::new(input)?, read_timeout),
            builder: RpcBuilder::with_placeholder(""),
            token: INVALID_TOKEN + 1,
            write_timeout,
            pending_values: 0,
        })
    }

    /// Descriptor to poll for inbound frames.
    pub fn as_raw_fd(&self) -> RawFd {
        self.input.as_raw_fd()
    }

    /// Token the next request will get.
    pub fn next_token(&self) -> u32 {
        self.token
    }

    /// Tell whether inbound bytes are already in memory.
    pub fn has_buffered(&self) -> bool {
        self.input.buffered() > 0
    }

    /// Send a complete request, returns its token.
    pub fn send_rpc_request(&mut self, method: &str, args: &[RpcArg]) -> u32 {
        let token = self.begin_rpc_request(method, args).0;
        self.end_rpc_request();
        token
    }

    /// Start a request whose argument array stays open. Add the remaining arguments to the
    /// returned builder and finish with [`EditorDriver::end_rpc_request`].
    pub fn begin_rpc_request(&mut self, method: &str, args: &[RpcArg]) -> (u32, &mut RpcBuilder) {
        let token = self.token;
        self.token += 1;
        self.builder.restart(token, method);
        self.builder.open_array();
        for arg in args {
            self.builder.add(arg);
        }
        (token, &mut self.builder)
    }

    pub fn end_rpc_request(&mut self) {
        self.builder.close_array();
        let request = self.builder.finish();
        if let Err(e) = self.output.write_exactly(request, self.write_timeout) {
            fatal!("Failed to send RPC request to the editor: {e}");
        }
    }

    /// Read the next inbound frame. Call only once input is ready or buffered.
    pub fn poll_event(&mut self) -> Result<Option<EditorEvent>, Error> {
        if cfg!(debug_assertions) {
            pdp_assert!(
                self.pending_values == 0,
                "{} result values were not consumed",
                self.pending_values
            );
        }
        self.pending_values = 0;

        match self.input.peek_byte()? {
            RESPONSE_HEADER => Ok(Some(EditorEvent::Response(self.read_response_header()?))),
            NOTIFICATION_HEADER => {
                let tree = RpcParser::new(&mut self.input).try_parse()?;
                Ok(Some(EditorEvent::Notification(tree)))
            }
            other => Err(Error::Desync(format!("unexpected frame header {other:#04x}"))),
        }
    }

    /// Read a response header, returns the token. Notifications are rejected.
    pub fn poll_response_token(&mut self) -> Result<u32, Error> {
        match self.poll_event()? {
            Some(EditorEvent::Response(token)) => Ok(token),
            Some(EditorEvent::Notification(_)) => {
                Err(Error::Desync("expected a response, got a notification".to_string()))
            }
            None => Err(Error::EndOfStream),
        }
    }

    fn read_response_header(&mut self) -> Result<u32, Error> {
        self.input.pop_byte()?;
        let kind = rpc_parser::read_integer(&mut self.input)?;
        if kind != MSG_RESPONSE {
            return Err(Error::Desync(format!("message type {kind} is not supported")));
        }
        let token = rpc_parser::read_integer(&mut self.input)?;
        let token = u32::try_from(token)
            .map_err(|_| Error::Desync(format!("response token {token} out of range")))?;

        if self.input.peek_byte()? == NIL {
            self.input.pop_byte()?;
        } else {
            let error = RpcParser::new(&mut self.input).try_parse()?;
            log::error!(target: "editor", "Request {token} failed: {}", error.rpc_view().to_json());
        }
        self.pending_values = 1;
        Ok(token)
    }

    fn take_value(&mut self) {
        if cfg!(debug_assertions) {
            pdp_assert!(self.pending_values > 0, "No response value left to consume");
        }
        self.pending_values = self.pending_values.saturating_sub(1);
    }

    pub fn read_bool(&mut self) -> Result<bool, Error> {
        self.take_value();
        rpc_parser::read_bool(&mut self.input)
    }

    pub fn read_integer(&mut self) -> Result<i64, Error> {
        self.take_value();
        rpc_parser::read_integer(&mut self.input)
    }

    pub fn read_string(&mut self) -> Result<String, Error> {
        self.take_value();
        rpc_parser::read_string(&mut self.input)
    }

    /// Open an array result, each element must then be consumed by a typed read.
    pub fn open_array(&mut self) -> Result<usize, Error> {
        self.take_value();
        let len = rpc_parser::read_array_len(&mut self.input)?;
        self.pending_values += len;
        Ok(len)
    }

    /// Discard a value nobody waits for.
    pub fn skip_result(&mut self) -> Result<(), Error> {
        self.take_value();
        rpc_parser::skip_value(&mut self.input)
    }
}
