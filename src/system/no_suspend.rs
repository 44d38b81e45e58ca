//! Sections where a handler must not suspend.
//!
//! Iteration over shared tables hands out borrows that would dangle if the task awaited in
//! the middle. Such sections hold a [`NoSuspendGuard`]; awaiting while any guard is alive is
//! a programmer error caught in debug builds.

use crate::fatal;
use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

pub struct NoSuspendGuard {
    // guard is bound to the thread whose counter it bumped
    _marker: PhantomData<*const ()>,
}

impl NoSuspendGuard {
    pub fn new() -> Self {
        DEPTH.with(|d| d.set(d.get() + 1));
        Self {
            _marker: PhantomData,
        }
    }
}

impl Default for NoSuspendGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoSuspendGuard {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

pub fn depth() -> u32 {
    DEPTH.with(Cell::get)
}

/// Abort if called inside a no-suspend section. Checked in debug builds only.
pub fn assert_may_suspend() {
    if cfg!(debug_assertions) && depth() > 0 {
        fatal!("Suspending inside a no-suspend section (depth {})", depth());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_nested_guards() {
        assert_eq!(depth(), 0);
        {
            let _outer = NoSuspendGuard::new();
            {
                let _inner = NoSuspendGuard::new();
                assert_eq!(depth(), 2);
            }
            assert_eq!(depth(), 1);
        }
        assert_eq!(depth(), 0);
        assert_may_suspend();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "no-suspend section")]
    fn test_suspend_inside_guard() {
        let _guard = NoSuspendGuard::new();
        assert_may_suspend();
    }
}
