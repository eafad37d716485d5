use std::fmt;
use std::io;

use easelcomm::comm::CommError;
use easelcomm::frame::FrameError;
use easelcomm::transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
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
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::PermissionDenied => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        TransportError::InvalidBuffer(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::Buffer(source) => transport_error(context, source),
        FrameError::TooLarge { .. }
        | FrameError::Truncated { .. }
        | FrameError::UnknownMessageType(_)
        | FrameError::Record(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn comm_error(context: &str, err: CommError) -> CliError {
    match err {
        CommError::Transport(err) => transport_error(context, err),
        CommError::Frame(err) => frame_error(context, err),
        CommError::BatchInterrupted { source, .. } => comm_error(context, *source),
        CommError::PayloadSizeMismatch { .. }
        | CommError::NoPayload
        | CommError::PayloadConsumed
        | CommError::InvalidBuffer(_)
        | CommError::Decode { .. } => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        CommError::NotConnected => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timeouts_map_to_timeout_code() {
        let err = comm_error(
            "connect failed",
            CommError::Transport(TransportError::Timeout(Duration::from_secs(1))),
        );
        assert_eq!(err.code, TIMEOUT);
        assert!(err.message.starts_with("connect failed: "));
    }

    #[test]
    fn batch_errors_use_their_source() {
        let err = comm_error(
            "send failed",
            CommError::BatchInterrupted {
                last_sent: Some(2),
                source: Box::new(CommError::Transport(TransportError::Disconnected)),
            },
        );
        assert_eq!(err.code, TRANSPORT_ERROR);
    }

    #[test]
    fn missing_socket_is_a_plain_failure() {
        let err = transport_error(
            "connect failed",
            TransportError::Connect {
                path: "/tmp/none.sock".into(),
                source: io::Error::from(io::ErrorKind::NotFound),
            },
        );
        assert_eq!(err.code, FAILURE);
    }
}
