//! Byte transports to a running server.

pub mod pipe;

pub use pipe::{PipeTransport, ReadMode};
