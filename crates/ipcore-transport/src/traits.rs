use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Result, TransportError};

/// Control operations the core announces to its transport.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlOp {
    CreateMessagePipe = 1,
    CreateDataPipe = 2,
    CreateSharedBuffer = 3,
    DuplicateBuffer = 4,
    Close = 5,
    WriteMessage = 6,
    WriteData = 7,
}

impl ControlOp {
    /// Wire value of this opcode.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Parse an opcode from its wire value.
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::CreateMessagePipe),
            2 => Some(Self::CreateDataPipe),
            3 => Some(Self::CreateSharedBuffer),
            4 => Some(Self::DuplicateBuffer),
            5 => Some(Self::Close),
            6 => Some(Self::WriteMessage),
            7 => Some(Self::WriteData),
            _ => None,
        }
    }

    /// Human-readable name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::CreateMessagePipe => "create_message_pipe",
            Self::CreateDataPipe => "create_data_pipe",
            Self::CreateSharedBuffer => "create_shared_buffer",
            Self::DuplicateBuffer => "duplicate_buffer",
            Self::Close => "close",
            Self::WriteMessage => "write_message",
            Self::WriteData => "write_data",
        }
    }
}

impl fmt::Display for ControlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u16> for ControlOp {
    type Error = TransportError;

    fn try_from(raw: u16) -> Result<Self> {
        Self::from_u16(raw).ok_or(TransportError::UnknownOpcode(raw))
    }
}

/// Numeric result codes shared by the transport contract and the core.
///
/// Values follow the canonical status numbering so they survive a trip
/// through another process unchanged.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    OutOfRange = 11,
    Internal = 13,
    ShouldWait = 17,
}

impl ResultCode {
    /// Parse a raw status value. Unrecognised values map to `Unknown`.
    pub fn from_i32(raw: i32) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            11 => Self::OutOfRange,
            13 => Self::Internal,
            17 => Self::ShouldWait,
            _ => Self::Unknown,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Turn a code returned for `op` into a `Result`.
    pub fn into_result(self, op: ControlOp) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(TransportError::Rejected { op, code: self })
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Internal => "INTERNAL",
            Self::ShouldWait => "SHOULD_WAIT",
        };
        f.write_str(name)
    }
}

/// A control message observed on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEvent {
    pub op: ControlOp,
    pub args: Bytes,
    /// Raw handle identifiers attached to the control message.
    pub handles: Vec<u32>,
}

impl ControlEvent {
    pub fn new(op: ControlOp, args: impl Into<Bytes>, handles: Vec<u32>) -> Self {
        Self {
            op,
            args: args.into(),
            handles,
        }
    }
}

/// The collaborator that carries handle-table operations across the
/// process boundary.
///
/// Implementations must be callable from any thread. `send_control` is
/// invoked while the core holds internal locks, so it must not call back
/// into the core and should not block for long.
pub trait Transport: Send + Sync {
    /// Announce a control operation together with the handles it names.
    fn send_control(&self, op: ControlOp, args: &[u8], handles: &[u32]) -> ResultCode;

    /// Pop the next pending event, if any. Never blocks.
    fn poll_event(&self) -> Option<ControlEvent>;

    /// Largest `args` accepted in one control message naming
    /// `handle_count` handles. `None` means unbounded.
    fn max_args_len(&self, handle_count: usize) -> Option<usize> {
        let _ = handle_count;
        None
    }

    /// Whether `poll_event` can ever return an event. Waiters only poll
    /// transports that do.
    fn produces_events(&self) -> bool {
        true
    }

    /// Transport name for diagnostics.
    fn name(&self) -> &'static str {
        "transport"
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send_control(&self, op: ControlOp, args: &[u8], handles: &[u32]) -> ResultCode {
        (**self).send_control(op, args, handles)
    }

    fn poll_event(&self) -> Option<ControlEvent> {
        (**self).poll_event()
    }

    fn max_args_len(&self, handle_count: usize) -> Option<usize> {
        (**self).max_args_len(handle_count)
    }

    fn produces_events(&self) -> bool {
        (**self).produces_events()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// A transport that accepts every control message and produces no events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn send_control(&self, _op: ControlOp, _args: &[u8], _handles: &[u32]) -> ResultCode {
        ResultCode::Ok
    }

    fn poll_event(&self) -> Option<ControlEvent> {
        None
    }

    fn produces_events(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "null"
    }
}
