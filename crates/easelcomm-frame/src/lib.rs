//! Framing for easelcomm.
//!
//! Two layers of framing live here:
//!
//! - **Link frames** ([`codec`], [`reader`], [`writer`]): what crosses the
//!   socket. Every frame carries a kind, a message id and two length-prefixed
//!   sections, the message bytes and the DMA bytes.
//! - **Messages** ([`message`]): what crosses a channel. A fixed 12-byte
//!   header (channel, type, payload id) followed by the body, optionally
//!   paired with a DMA payload that is pulled on demand.

pub mod codec;
pub mod error;
pub mod message;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, encode_header, peek_frame_len, FrameConfig, FrameKind,
    LinkFrame, DEFAULT_MAX_DMA, DEFAULT_MAX_MESSAGE, FLAG_CANCELLED, FLAG_NEEDS_REPLY,
    HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use message::{ChannelId, Header, Message, MessageType, MESSAGE_HEADER_SIZE};
pub use reader::FrameReader;
pub use writer::FrameWriter;
