//! Headless debugging coordinator between GDB/MI and a Neovim msgpack-RPC front end.

pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod expr;
pub mod io;
pub mod log;
pub mod parser;
pub mod system;
pub mod tracer;
