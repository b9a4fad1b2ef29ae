use std::fmt;
use std::io;

use ipcore_system::CoreError;
use ipcore_wire::WireError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const HEALTH_CHECK_FAILED: i32 = 30;
pub const RESOURCE_EXHAUSTED: i32 = 40;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::NotFound => USAGE,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn core_error(context: &str, err: CoreError) -> CliError {
    let code = match &err {
        CoreError::InvalidArgument(_) | CoreError::InvalidHandle(_) | CoreError::OutOfRange(_) => {
            DATA_INVALID
        }
        CoreError::ResourceExhausted(_) => RESOURCE_EXHAUSTED,
        CoreError::DeadlineExceeded => TIMEOUT,
        CoreError::Transport(_) => TRANSPORT_ERROR,
        CoreError::FailedPrecondition(_) | CoreError::Cancelled | CoreError::ShouldWait => FAILURE,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn wire_error(context: &str, err: WireError) -> CliError {
    match err {
        WireError::Io(source) => io_error(context, source),
        WireError::Transport(_) => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_distinct_exit_codes() {
        assert_eq!(core_error("x", CoreError::DeadlineExceeded).code, TIMEOUT);
        assert_eq!(
            core_error("x", CoreError::ResourceExhausted("full".into())).code,
            RESOURCE_EXHAUSTED
        );
        assert_eq!(
            core_error("x", CoreError::InvalidArgument("bad".into())).code,
            DATA_INVALID
        );
        assert_eq!(core_error("x", CoreError::Cancelled).code, FAILURE);
    }

    #[test]
    fn error_message_carries_context() {
        let err = core_error("pump", CoreError::DeadlineExceeded);
        assert_eq!(err.to_string(), "pump: deadline exceeded");
    }

    #[test]
    fn wire_io_errors_use_io_mapping() {
        let err = wire_error(
            "records",
            WireError::Io(io::Error::from(io::ErrorKind::PermissionDenied)),
        );
        assert_eq!(err.code, PERMISSION_DENIED);
        assert_eq!(wire_error("records", WireError::InvalidMagic).code, DATA_INVALID);
    }
}
