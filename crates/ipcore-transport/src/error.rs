use crate::traits::{ControlOp, ResultCode};

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport refused a control message.
    #[error("transport rejected {op} with {code}")]
    Rejected { op: ControlOp, code: ResultCode },

    /// An I/O error occurred on the underlying byte stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An opcode on the wire does not name a known control operation.
    #[error("unknown control opcode {0}")]
    UnknownOpcode(u16),

    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;
