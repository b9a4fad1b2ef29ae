//! Control-record wire codec and stream transport for ipcore.
//!
//! Every control message the core announces can be carried over a plain
//! byte stream. Each record is framed with:
//! - A 2-byte magic number ("MJ") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian opcode
//! - A 2-byte little-endian handle count, followed by the handle refs
//!
//! [`StreamTransport`] implements [`ipcore_transport::Transport`] on top of
//! any `Read + Write` stream, such as one end of a Unix socket pair.

pub mod codec;
pub mod error;
pub mod reader;
pub mod stream;

#[cfg(feature = "async")]
pub mod async_codec;

#[cfg(feature = "async")]
pub use async_codec::RecordCodec;
pub use codec::{
    decode_record, encode_record, ControlRecord, WireConfig, DEFAULT_MAX_PENDING_BYTES,
    DEFAULT_MAX_RECORD_PAYLOAD, HEADER_SIZE, MAGIC, MAX_RECORD_HANDLES,
};
pub use error::{Result, WireError};
pub use reader::RecordReader;
pub use stream::StreamTransport;
