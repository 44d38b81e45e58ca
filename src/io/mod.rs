pub mod byte_stream;
pub mod descriptor;
pub mod rolling_buffer;
