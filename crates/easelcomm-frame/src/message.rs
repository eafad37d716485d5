//! Channel-addressed messages.
//!
//! Every message is one contiguous buffer: a fixed header followed by the
//! body. Received messages borrow their buffer from the link (a `Bytes`
//! slice of the frame that carried them); outbound messages own a fresh one.
//! A DMA payload is never part of the buffer, only its descriptor is.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use easelcomm_transport::{HardwareBuffer, InboundMessage, PayloadDescriptor};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{FrameError, Result};

/// Logical sub-protocol within one session.
pub type ChannelId = u32;

/// Header: channel (4) + type (4) + payload id (4) = 12 bytes, all LE.
pub const MESSAGE_HEADER_SIZE: usize = 12;

/// Payload id written when the attached buffer carries no id.
const NO_PAYLOAD_ID: u32 = u32::MAX;

/// How the body is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    /// Opaque bytes.
    Raw = 0,
    /// UTF-8 text followed by a NUL terminator.
    String = 1,
    /// A serialized structured record (JSON).
    Record = 2,
    /// Empty liveness probe.
    Ping = 3,
}

impl TryFrom<u32> for MessageType {
    type Error = FrameError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Raw),
            1 => Ok(MessageType::String),
            2 => Ok(MessageType::Record),
            3 => Ok(MessageType::Ping),
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }
}

/// Fixed header prefixed to every message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub channel: ChannelId,
    pub message_type: MessageType,
    /// Id of the attached payload buffer, if it has one.
    pub payload_id: Option<u32>,
}

impl Header {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.channel);
        dst.put_u32_le(self.message_type as u32);
        dst.put_u32_le(self.payload_id.unwrap_or(NO_PAYLOAD_ID));
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < MESSAGE_HEADER_SIZE {
            return Err(FrameError::Truncated {
                size: src.len(),
                header: MESSAGE_HEADER_SIZE,
            });
        }
        let word = |at: usize| u32::from_le_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]]);
        let payload_id = match word(8) {
            NO_PAYLOAD_ID => None,
            id => Some(id),
        };
        Ok(Self {
            channel: word(0),
            message_type: MessageType::try_from(word(4))?,
            payload_id,
        })
    }
}

/// A framed unit: header + body, plus the descriptor of an optional payload.
#[derive(Debug)]
pub struct Message {
    header: Header,
    buf: Bytes,
    payload: Option<PayloadDescriptor>,
    message_id: Option<u32>,
    needs_reply: bool,
    payload_consumed: AtomicBool,
}

impl Message {
    /// Raw bytes on `channel`, optionally announcing `payload`.
    pub fn from_raw(channel: ChannelId, body: &[u8], payload: Option<&HardwareBuffer>) -> Self {
        Self::build(channel, MessageType::Raw, body.len(), payload, |dst| {
            dst.put_slice(body)
        })
    }

    /// Text on `channel`. The terminator is added here and stripped by [`Message::as_str`].
    pub fn from_string(channel: ChannelId, text: &str, payload: Option<&HardwareBuffer>) -> Self {
        Self::build(channel, MessageType::String, text.len() + 1, payload, |dst| {
            dst.put_slice(text.as_bytes());
            dst.put_u8(0);
        })
    }

    /// A serialized record on `channel`.
    pub fn from_record<T: Serialize>(
        channel: ChannelId,
        record: &T,
        payload: Option<&HardwareBuffer>,
    ) -> Result<Self> {
        let encoded = serde_json::to_vec(record)?;
        Ok(Self::build(
            channel,
            MessageType::Record,
            encoded.len(),
            payload,
            |dst| dst.put_slice(&encoded),
        ))
    }

    /// Empty liveness probe on `channel`.
    pub fn ping(channel: ChannelId) -> Self {
        Self::build(channel, MessageType::Ping, 0, None, |_| {})
    }

    /// Wrap a message delivered by the link. The body is not copied.
    pub fn from_inbound(inbound: InboundMessage) -> Result<Self> {
        let header = Header::decode(&inbound.body)?;
        let payload = (inbound.dma_size > 0).then_some(PayloadDescriptor {
            size: inbound.dma_size,
            id: header.payload_id,
        });
        Ok(Self {
            header,
            buf: inbound.body,
            payload,
            message_id: Some(inbound.message_id),
            needs_reply: inbound.needs_reply,
            payload_consumed: AtomicBool::new(false),
        })
    }

    fn build(
        channel: ChannelId,
        message_type: MessageType,
        body_len: usize,
        payload: Option<&HardwareBuffer>,
        write_body: impl FnOnce(&mut BytesMut),
    ) -> Self {
        let header = Header {
            channel,
            message_type,
            payload_id: payload.and_then(HardwareBuffer::id),
        };
        let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + body_len);
        header.encode(&mut buf);
        write_body(&mut buf);
        Self {
            header,
            buf: buf.freeze(),
            payload: payload.map(HardwareBuffer::descriptor),
            message_id: None,
            needs_reply: false,
            payload_consumed: AtomicBool::new(false),
        }
    }

    /// Ask the remote side for a correlated reply.
    pub fn with_needs_reply(mut self, needs_reply: bool) -> Self {
        self.needs_reply = needs_reply;
        self
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn channel(&self) -> ChannelId {
        self.header.channel
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// The whole encoded message (header + body).
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The body without the header.
    pub fn body(&self) -> &[u8] {
        &self.buf[MESSAGE_HEADER_SIZE..]
    }

    /// The body as a shared slice of the message buffer.
    pub fn body_bytes(&self) -> Bytes {
        self.buf.slice(MESSAGE_HEADER_SIZE..)
    }

    pub fn total_size(&self) -> usize {
        self.buf.len()
    }

    pub fn header_size(&self) -> usize {
        MESSAGE_HEADER_SIZE
    }

    pub fn body_size(&self) -> usize {
        self.total_size() - self.header_size()
    }

    /// Link message id; only set on received messages.
    pub fn message_id(&self) -> Option<u32> {
        self.message_id
    }

    pub fn needs_reply(&self) -> bool {
        self.needs_reply
    }

    /// True iff a non-empty payload is attached.
    pub fn has_payload(&self) -> bool {
        self.payload.is_some_and(|payload| payload.size > 0)
    }

    pub fn payload(&self) -> Option<PayloadDescriptor> {
        self.payload
    }

    /// True while an attached payload has been neither pulled nor discarded.
    pub fn payload_pending(&self) -> bool {
        self.has_payload() && !self.payload_consumed.load(Ordering::Acquire)
    }

    /// Record that the payload was pulled or discarded.
    ///
    /// Returns false if it had already been consumed.
    pub fn mark_payload_consumed(&self) -> bool {
        !self.payload_consumed.swap(true, Ordering::AcqRel)
    }

    /// The body as text, if this is a well-formed String message.
    pub fn as_str(&self) -> Option<&str> {
        if self.message_type() != MessageType::String {
            debug!(
                channel = self.channel(),
                message_type = ?self.message_type(),
                "not a string message"
            );
            return None;
        }
        let Some((&0, text)) = self.body().split_last() else {
            debug!(channel = self.channel(), "string message missing terminator");
            return None;
        };
        match std::str::from_utf8(text) {
            Ok(text) => Some(text),
            Err(err) => {
                debug!(channel = self.channel(), error = %err, "string message is not UTF-8");
                None
            }
        }
    }

    /// The body as a record, if this is a Record message that decodes as `T`.
    pub fn to_record<T: DeserializeOwned>(&self) -> Option<T> {
        if self.message_type() != MessageType::Record {
            debug!(
                channel = self.channel(),
                message_type = ?self.message_type(),
                "not a record message"
            );
            return None;
        }
        match serde_json::from_slice(self.body()) {
            Ok(record) => Some(record),
            Err(err) => {
                debug!(channel = self.channel(), error = %err, "record decode failed");
                None
            }
        }
    }
}
