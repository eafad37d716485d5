/// Errors that can occur while encoding or decoding frames and messages.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x4543 \"EC\")")]
    InvalidMagic,

    /// The frame kind byte is not one the link understands.
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    /// A frame section exceeds the configured maximum size.
    #[error("{section} too large ({size} bytes, max {max})")]
    TooLarge {
        section: &'static str,
        size: usize,
        max: usize,
    },

    /// A message is shorter than its fixed header.
    #[error("message truncated ({size} bytes, header is {header})")]
    Truncated { size: usize, header: usize },

    /// The message header names an unknown message type.
    #[error("unknown message type {0}")]
    UnknownMessageType(u32),

    /// A structured record could not be serialized.
    #[error("record encoding failed: {0}")]
    Record(#[from] serde_json::Error),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The DMA source buffer could not be read.
    #[error("DMA source unavailable: {0}")]
    Buffer(#[from] easelcomm_transport::TransportError),

    /// The connection was closed before a complete frame was transferred.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
