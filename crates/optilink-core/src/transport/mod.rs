//! Framed TCP transport.
//!
//! Every message on the wire is a 16-byte header holding the payload length
//! twice as big-endian `u64`, followed by the payload itself:
//!
//! ```text
//! [u64 BE: len][u64 BE: len][payload bytes of len]
//! ```

mod client;
pub mod frame;

pub use client::TcpClient;
