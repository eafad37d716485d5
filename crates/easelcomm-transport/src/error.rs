use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur in link transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind the service socket.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the service socket.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the link.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The service channel was not established in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// No session is open on this transport.
    #[error("transport not connected")]
    NotConnected,

    /// The session was already open when `open` was called.
    #[error("transport already open")]
    AlreadyOpen,

    /// The remote end went away.
    #[error("link disconnected")]
    Disconnected,

    /// A buffer handed to a transfer API is unusable (EINVAL class).
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    /// `receive_dma`/`cancel_receive_dma` named a message with no staged payload.
    #[error("no pending DMA payload for message {0}")]
    NoPendingDma(u32),

    /// The link handshake was rejected.
    #[error("link handshake failed: {0}")]
    Handshake(String),

    /// The peer sent something the link protocol does not allow.
    #[error("link protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// True when the error means the link is gone rather than a local mistake.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TransportError::Disconnected | TransportError::NotConnected
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
