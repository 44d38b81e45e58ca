//! Token keyed table of suspended handlers.
//!
//! Handlers are plain futures polled by hand. A handler suspends only on an editor request
//! awaiter, which announces the token it waits for before returning `Pending`. Responses come
//! back in token order, so the table is a queue sorted by token and only its head may resume.

use crate::fatal;
use itertools::Itertools;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

pub type Handler = Pin<Box<dyn Future<Output = ()>>>;

/// Handlers are resumed by tokens, never by wakeups.
struct NoopWaker;

impl Wake for NoopWaker {
    fn wake(self: Arc<Self>) {}
}

pub struct Dispatcher {
    suspended: RefCell<VecDeque<(u32, Handler)>>,
    announced: Cell<Option<u32>>,
    waker: Waker,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            suspended: RefCell::new(VecDeque::new()),
            announced: Cell::new(None),
            waker: Waker::from(Arc::new(NoopWaker)),
        }
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by an awaiter right before it returns `Pending`.
    pub fn announce(&self, token: u32) {
        if let Some(previous) = self.announced.replace(Some(token)) {
            fatal!("Token {previous} announced but never picked up");
        }
    }

    /// Run a new handler until it completes or suspends.
    pub fn spawn(&self, handler: Handler) {
        self.run(handler);
    }

    /// Resume the handler waiting for `token`. Returns `false` if nobody waits for it, then
    /// the caller must skip the result.
    pub fn resume(&self, token: u32) -> bool {
        let handler = {
            let mut suspended = self.suspended.borrow_mut();
            match suspended.front().map(|(t, _)| *t) {
                Some(head) if head == token => suspended.pop_front().map(|(_, h)| h),
                Some(head) if head < token => {
                    fatal!("Response {token} arrived while handler waits for {head}")
                }
                _ => None,
            }
        };
        match handler {
            Some(handler) => {
                self.run(handler);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.suspended.borrow().is_empty()
    }

    pub fn len(&self) -> usize {
        self.suspended.borrow().len()
    }

    pub fn suspended_tokens(&self) -> Vec<u32> {
        self.suspended.borrow().iter().map(|(t, _)| *t).collect()
    }

    /// Drop every suspended handler.
    pub fn clear(&self) {
        let dropped = std::mem::take(&mut *self.suspended.borrow_mut());
        if !dropped.is_empty() {
            log::warn!(
                target: "coordinator",
                "Dropping suspended handlers, tokens: {}",
                dropped.iter().map(|(t, _)| t).join(" ")
            );
        }
    }

    fn run(&self, mut handler: Handler) {
        let mut cx = Context::from_waker(&self.waker);
        match handler.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                if let Some(token) = self.announced.take() {
                    fatal!("Handler finished after announcing token {token}");
                }
            }
            Poll::Pending => match self.announced.take() {
                Some(token) => self.suspend(token, handler),
                None => fatal!("Handler suspended without an editor request"),
            },
        }
    }

    fn suspend(&self, token: u32, handler: Handler) {
        let mut suspended = self.suspended.borrow_mut();
        let head = suspended.front().map(|(t, _)| *t);
        let back = suspended.back().map(|(t, _)| *t);
        match (head, back) {
            (None, _) => suspended.push_back((token, handler)),
            (_, Some(back)) if back < token => suspended.push_back((token, handler)),
            (Some(head), _) if token < head => suspended.push_front((token, handler)),
            _ => {
                let pos = suspended.partition_point(|(t, _)| *t < token);
                if suspended[pos].0 == token {
                    fatal!("Two handlers wait for token {token}");
                }
                suspended.insert(pos, (token, handler));
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.clear();
    }
}
