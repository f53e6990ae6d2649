pub mod content;
pub mod framed;
pub mod message;
pub mod tcp_stream;
