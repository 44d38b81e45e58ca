//! Futures resolved by editor responses.
//!
//! The request is already sent when an awaiter is created. Awaiting it suspends the handler
//! under the request token, the result is read from the editor stream on resume.

use crate::coordinator::dispatcher::Dispatcher;
use crate::driver::editor::EditorDriver;
use crate::error::Error;
use crate::pdp_assert;
use crate::system::no_suspend;
use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Typed read of a response result slot.
pub trait RpcResult: Sized {
    fn read(editor: &mut EditorDriver) -> Result<Self, Error>;
}

impl RpcResult for bool {
    fn read(editor: &mut EditorDriver) -> Result<Self, Error> {
        editor.read_bool()
    }
}

impl RpcResult for i64 {
    fn read(editor: &mut EditorDriver) -> Result<Self, Error> {
        editor.read_integer()
    }
}

impl RpcResult for String {
    fn read(editor: &mut EditorDriver) -> Result<Self, Error> {
        editor.read_string()
    }
}

impl RpcResult for Vec<i64> {
    fn read(editor: &mut EditorDriver) -> Result<Self, Error> {
        let len = editor.open_array()?;
        (0..len).map(|_| editor.read_integer()).collect()
    }
}

pub struct RpcAwaiter<'a, T> {
    dispatcher: &'a Dispatcher,
    editor: &'a RefCell<EditorDriver>,
    token: u32,
    suspended: bool,
    _result: PhantomData<fn() -> T>,
}

pub type BoolAwaiter<'a> = RpcAwaiter<'a, bool>;
pub type IntegerAwaiter<'a> = RpcAwaiter<'a, i64>;
pub type StringAwaiter<'a> = RpcAwaiter<'a, String>;
pub type IntegerArrayAwaiter<'a> = RpcAwaiter<'a, Vec<i64>>;

impl<'a, T: RpcResult> RpcAwaiter<'a, T> {
    pub fn new(dispatcher: &'a Dispatcher, editor: &'a RefCell<EditorDriver>, token: u32) -> Self {
        Self {
            dispatcher,
            editor,
            token,
            suspended: false,
            _result: PhantomData,
        }
    }

    pub fn token(&self) -> u32 {
        self.token
    }
}

impl<T: RpcResult> Future for RpcAwaiter<'_, T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.suspended {
            no_suspend::assert_may_suspend();
            this.suspended = true;
            this.dispatcher.announce(this.token);
            return Poll::Pending;
        }
        Poll::Ready(T::read(&mut this.editor.borrow_mut()))
    }
}

/// Requests sent back to back whose results are awaited in order.
pub struct RpcQueue<'a, T> {
    dispatcher: &'a Dispatcher,
    editor: &'a RefCell<EditorDriver>,
    begin: u32,
    end: u32,
    _result: PhantomData<fn() -> T>,
}

pub type IntegerRpcQueue<'a> = RpcQueue<'a, i64>;
pub type StringRpcQueue<'a> = RpcQueue<'a, String>;

impl<'a, T: RpcResult> RpcQueue<'a, T> {
    pub fn new(dispatcher: &'a Dispatcher, editor: &'a RefCell<EditorDriver>) -> Self {
        let token = editor.borrow().next_token();
        Self {
            dispatcher,
            editor,
            begin: token,
            end: token,
            _result: PhantomData,
        }
    }

    /// Append a request that was just sent.
    pub fn push(&mut self, awaiter: RpcAwaiter<'a, T>) {
        pdp_assert!(
            awaiter.token == self.end,
            "Queued token {} is not contiguous with {}",
            awaiter.token,
            self.end
        );
        self.end += 1;
    }

    /// Awaiter for the oldest result not awaited yet.
    pub fn next(&mut self) -> Option<RpcAwaiter<'a, T>> {
        if self.is_empty() {
            return None;
        }
        let token = self.begin;
        self.begin += 1;
        Some(RpcAwaiter::new(self.dispatcher, self.editor, token))
    }

    pub fn len(&self) -> usize {
        (self.end - self.begin) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }
}

impl<T> Drop for RpcQueue<'_, T> {
    fn drop(&mut self) {
        if self.begin != self.end {
            log::debug!(
                target: "coordinator",
                "Results of tokens {}..{} are not awaited",
                self.begin,
                self.end
            );
        }
    }
}
