//! Parsers producing [`crate::expr::ExprTree`] and the msgpack frame builder.

pub mod mi;
pub mod rpc_builder;
pub mod rpc_parser;

pub use mi::parse_mi;
pub use rpc_builder::{RpcArg, RpcBuilder};
pub use rpc_parser::RpcParser;
