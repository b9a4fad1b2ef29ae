/// Errors that can occur while encoding or decoding control records.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The record header contains an invalid magic number.
    #[error("invalid record magic (expected 0x4D4A \"MJ\")")]
    InvalidMagic,

    /// The record payload exceeds the configured maximum size.
    #[error("record payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// More handle refs than the header can describe.
    #[error("too many handle refs in one record ({count}, max {max})")]
    TooManyHandles { count: usize, max: usize },

    /// The header is well-formed but its fields are inconsistent.
    #[error("malformed record: {0}")]
    Malformed(&'static str),

    /// The opcode or another transport-level field was rejected.
    #[error("transport error: {0}")]
    Transport(#[from] ipcore_transport::TransportError),

    /// An I/O error occurred while reading or writing records.
    #[error("record I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream was closed before a complete record was received.
    #[error("connection closed (incomplete record)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, WireError>;
