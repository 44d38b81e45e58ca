pub mod breakpoint;
pub mod editor;
pub mod gdb;
pub mod ssh;
