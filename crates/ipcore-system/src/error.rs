use ipcore_transport::{ResultCode, TransportError};

use crate::handle::HandleId;

/// Errors returned by core operations.
///
/// Every failure travels through this one result channel; the core never
/// aborts on its own. Use [`CoreError::code`] to branch on the kind.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed options, out-of-range offsets, zero-sized buffers.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The identifier does not name a live handle in this core.
    #[error("invalid handle {0}")]
    InvalidHandle(HandleId),

    /// A configured or system limit was hit.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The operation is not valid in the object's current state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// An all-or-none request could not be satisfied in full.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Nothing to do yet; wait for the matching signal and retry.
    #[error("operation should wait")]
    ShouldWait,

    /// The waited handle was closed while the wait was in progress.
    #[error("wait cancelled: handle closed")]
    Cancelled,

    /// A finite wait timed out.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The transport refused to carry the operation.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl CoreError {
    /// The numeric result code for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            Self::InvalidArgument(_) | Self::InvalidHandle(_) => ResultCode::InvalidArgument,
            Self::ResourceExhausted(_) => ResultCode::ResourceExhausted,
            Self::FailedPrecondition(_) => ResultCode::FailedPrecondition,
            Self::OutOfRange(_) => ResultCode::OutOfRange,
            Self::ShouldWait => ResultCode::ShouldWait,
            Self::Cancelled => ResultCode::Cancelled,
            Self::DeadlineExceeded => ResultCode::DeadlineExceeded,
            Self::Transport(TransportError::Rejected { code, .. }) => *code,
            Self::Transport(_) => ResultCode::Internal,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub(crate) fn exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted(message.into())
    }

    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Self::FailedPrecondition(message.into())
    }

    pub(crate) fn out_of_range(message: impl Into<String>) -> Self {
        Self::OutOfRange(message.into())
    }
}

/// Failure of [`Core::wait_many`](crate::Core::wait_many).
///
/// `index` names the handle that resolved the wait when there is one
/// (an unsatisfiable or closed handle); it is `None` for timeouts and
/// argument errors.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct WaitManyError {
    pub error: CoreError,
    pub index: Option<usize>,
}

impl WaitManyError {
    pub(crate) fn at(index: usize, error: CoreError) -> Self {
        Self {
            error,
            index: Some(index),
        }
    }

    pub(crate) fn global(error: CoreError) -> Self {
        Self { error, index: None }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use ipcore_transport::ControlOp;

    use super::*;

    #[test]
    fn codes_follow_error_kind() {
        assert_eq!(
            CoreError::invalid("x").code(),
            ResultCode::InvalidArgument
        );
        assert_eq!(CoreError::ShouldWait.code(), ResultCode::ShouldWait);
        assert_eq!(
            CoreError::DeadlineExceeded.code(),
            ResultCode::DeadlineExceeded
        );
    }

    #[test]
    fn transport_rejection_keeps_its_code() {
        let err = CoreError::from(TransportError::Rejected {
            op: ControlOp::CreateMessagePipe,
            code: ResultCode::ResourceExhausted,
        });
        assert_eq!(err.code(), ResultCode::ResourceExhausted);
        assert_eq!(
            CoreError::from(TransportError::Shutdown).code(),
            ResultCode::Internal
        );
    }

    #[test]
    fn wait_many_error_displays_inner_error() {
        let err = WaitManyError::at(2, CoreError::Cancelled);
        assert_eq!(err.to_string(), "wait cancelled: handle closed");
        assert_eq!(err.index, Some(2));
    }
}
