//! Program arguments prepared before a fork, the child execs without allocating.

use nix::errno::Errno;
use nix::libc;
use std::ffi::{CStr, CString};

pub struct ExecArgs {
    args: Vec<CString>,
    argv: Vec<*const libc::c_char>,
}

impl ExecArgs {
    /// `program` is both the executable path and `argv[0]`.
    pub fn new(program: CString, args: impl IntoIterator<Item = CString>) -> Self {
        let args: Vec<CString> = std::iter::once(program).chain(args).collect();
        // pointers target the heap buffers of `args`, they survive moves of the vector
        let argv = args
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        Self { args, argv }
    }

    pub fn program(&self) -> &CStr {
        &self.args[0]
    }

    /// Null terminated argument vector.
    pub fn argv(&self) -> &[*const libc::c_char] {
        &self.argv
    }

    /// Replace the process image. Returns only if exec failed.
    ///
    /// Async-signal-safe, may be called in a forked child.
    pub fn exec(&self) -> Errno {
        // SAFETY: `argv` is a null terminated array of pointers into `args`.
        unsafe { libc::execv(self.argv[0], self.argv.as_ptr()) };
        Errno::last()
    }
}
