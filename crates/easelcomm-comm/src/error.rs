use easelcomm_frame::{ChannelId, FrameError};
use easelcomm_transport::TransportError;

/// Errors that can occur in endpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    /// Link-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Encoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Destination buffer does not match the announced payload size.
    #[error("payload size mismatch: message carries {expected} bytes, destination holds {actual}")]
    PayloadSizeMismatch { expected: usize, actual: usize },

    /// The message carries no payload to receive.
    #[error("message has no payload")]
    NoPayload,

    /// The payload was already received or discarded.
    #[error("payload already consumed")]
    PayloadConsumed,

    /// A buffer handed to a transfer API is unusable.
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    /// No session is open.
    #[error("not connected")]
    NotConnected,

    /// A reply could not be decoded as the expected record.
    #[error("could not decode {expected} from channel {channel}")]
    Decode {
        channel: ChannelId,
        expected: &'static str,
    },

    /// A buffer batch stopped early.
    #[error("buffer batch interrupted after id {last_sent:?}: {source}")]
    BatchInterrupted {
        /// Id of the last buffer delivered, `None` if none was.
        last_sent: Option<u32>,
        source: Box<CommError>,
    },

    /// A blocking call was made from the endpoint's own receive thread,
    /// where the reply could never be dispatched.
    #[error("blocking call issued from the receive thread")]
    CalledFromReceiveThread,
}

pub type Result<T> = std::result::Result<T, CommError>;
