use std::fmt;
use std::io::Write;
use std::str::Utf8Error;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("{0} failed: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("timeout ({0:?}) while {1}")]
    Timeout(Duration, &'static str),
    #[error("unexpected end of stream")]
    EndOfStream,
    #[error("child table is full ({0} entries)")]
    TooManyChildren(usize),

    // --------------------------------- parsing errors --------------------------------------------
    #[error("gdb/mi syntax error: {0}")]
    MiParse(String),
    #[error("msgpack error: {0}")]
    RpcParse(String),

    // --------------------------------- wire errors -----------------------------------------------
    #[error("rpc stream desynchronized: {0}")]
    Desync(String),

    // --------------------------------- execution trace errors ------------------------------------
    #[error("execution trace corrupted: {0}")]
    TraceCorrupted(String),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::Utf8(_) => false,
            Error::Config(_) => false,
            Error::Syscall(_, _) => false,
            Error::Timeout(_, _) => false,
            Error::EndOfStream => false,
            Error::TooManyChildren(_) => false,
            Error::MiParse(_) => false,
            Error::RpcParse(_) => false,

            // the peer is no longer describable
            Error::Desync(_) => true,
            Error::TraceCorrupted(_) => true,
        }
    }
}

/// Write a message straight to stderr and abort the process.
///
/// Logging is bypassed on purpose, the logger may be the thing that is broken.
/// Unit tests panic instead of aborting so fatal paths stay observable.
#[cold]
pub fn fatal_error(file: &'static str, line: u32, msg: fmt::Arguments) -> ! {
    let mut stderr = std::io::stderr().lock();
    _ = writeln!(stderr, "[{file}:{line}] fatal: {msg}");
    _ = stderr.flush();
    drop(stderr);

    if cfg!(test) {
        panic!("fatal: {msg}");
    }
    std::process::abort()
}

/// Log a failed syscall result and convert it into an `Option`.
pub fn check<T>(result: nix::Result<T>, op: &'static str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(errno) => {
            log::error!(target: "pdp", "{op} failed: {}", errno.desc());
            None
        }
    }
}

/// Like [`check`] but a failure aborts the process.
pub fn check_fatal<T>(result: nix::Result<T>, op: &'static str) -> T {
    match result {
        Ok(value) => value,
        Err(errno) => fatal_error(file!(), line!(), format_args!("{op}: {}", errno.desc())),
    }
}

/// Abort with a formatted message, see [`fatal_error`].
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)+) => {
        $crate::error::fatal_error(file!(), line!(), format_args!($($arg)+))
    };
}

/// Abort if condition does not hold. Always checked, release builds included.
#[macro_export]
macro_rules! pdp_assert {
    ($cond:expr) => {
        if !$cond {
            $crate::fatal!("assertion failed: {}", stringify!($cond))
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::fatal!($($arg)+)
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "pdp", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "pdp", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
