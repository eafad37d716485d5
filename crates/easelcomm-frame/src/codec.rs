use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: magic (2) + kind (1) + flags (1) + message id (4)
/// + message length (4) + DMA length (8) = 20 bytes.
pub const HEADER_SIZE: usize = 20;

/// Magic bytes: "EC" (0x45 0x43).
pub const MAGIC: [u8; 2] = [0x45, 0x43];

/// Default maximum message section size: 64 KiB.
pub const DEFAULT_MAX_MESSAGE: usize = 64 * 1024;

/// Default maximum DMA section size: 256 MiB.
pub const DEFAULT_MAX_DMA: usize = 256 * 1024 * 1024;

/// The sender expects a reply correlated to this message.
pub const FLAG_NEEDS_REPLY: u8 = 0x01;

/// On a DMA_DONE frame: the payload was discarded, not transferred.
pub const FLAG_CANCELLED: u8 = 0x02;

/// What a link frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A channel message, possibly followed by DMA bytes.
    Message = 1,
    /// The receiver finished (or discarded) the DMA announced by `message_id`.
    DmaDone = 2,
    /// Link handshake, JSON body.
    Hello = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::Message),
            2 => Ok(FrameKind::DmaDone),
            3 => Ok(FrameKind::Hello),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// A decoded link frame.
#[derive(Debug, Clone)]
pub struct LinkFrame {
    pub kind: FrameKind,
    pub flags: u8,
    pub message_id: u32,
    /// Message section.
    pub body: Bytes,
    /// DMA section, empty when no payload travels with the frame.
    pub dma: Bytes,
}

impl LinkFrame {
    /// A frame with a message section only.
    pub fn new(kind: FrameKind, message_id: u32, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            flags: 0,
            message_id,
            body: body.into(),
            dma: Bytes::new(),
        }
    }

    /// Completion (or cancellation) notice for a DMA transfer.
    pub fn dma_done(message_id: u32, cancelled: bool) -> Self {
        let mut frame = Self::new(FrameKind::DmaDone, message_id, Bytes::new());
        if cancelled {
            frame.flags |= FLAG_CANCELLED;
        }
        frame
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }

    /// The total wire size of this frame.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.body.len() + self.dma.len()
    }
}

/// Encode a frame header.
///
/// Wire format:
/// ```text
/// ┌───────────┬──────┬───────┬────────────┬──────────┬──────────┬─────────┬──────────┐
/// │ Magic (2) │ Kind │ Flags │ Message id │ Msg len  │ DMA len  │ Message │ DMA      │
/// │ "EC"      │ (1)  │ (1)   │ (4B LE)    │ (4B LE)  │ (8B LE)  │ bytes   │ bytes    │
/// └───────────┴──────┴───────┴────────────┴──────────┴──────────┴─────────┴──────────┘
/// ```
pub fn encode_header(
    kind: FrameKind,
    flags: u8,
    message_id: u32,
    body_len: usize,
    dma_len: usize,
    dst: &mut BytesMut,
) -> Result<()> {
    if body_len > u32::MAX as usize {
        return Err(FrameError::TooLarge {
            section: "message",
            size: body_len,
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE);
    dst.put_slice(&MAGIC);
    dst.put_u8(kind as u8);
    dst.put_u8(flags);
    dst.put_u32_le(message_id);
    dst.put_u32_le(body_len as u32);
    dst.put_u64_le(dma_len as u64);
    Ok(())
}

/// Encode a whole frame, DMA section included.
pub fn encode_frame(frame: &LinkFrame, dst: &mut BytesMut) -> Result<()> {
    encode_header(
        frame.kind,
        frame.flags,
        frame.message_id,
        frame.body.len(),
        frame.dma.len(),
        dst,
    )?;
    dst.reserve(frame.body.len() + frame.dma.len());
    dst.put_slice(&frame.body);
    dst.put_slice(&frame.dma);
    Ok(())
}

/// Total wire length of the frame at the front of `src`, once its header is in.
pub fn peek_frame_len(src: &[u8]) -> Option<usize> {
    if src.len() < HEADER_SIZE {
        return None;
    }
    let body_len = u32::from_le_bytes([src[8], src[9], src[10], src[11]]) as usize;
    let mut dma = [0u8; 8];
    dma.copy_from_slice(&src[12..20]);
    let dma_len = usize::try_from(u64::from_le_bytes(dma)).ok()?;
    HEADER_SIZE.checked_add(body_len)?.checked_add(dma_len)
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer; both sections are
/// split off without copying.
pub fn decode_frame(src: &mut BytesMut, config: &FrameConfig) -> Result<Option<LinkFrame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let kind = FrameKind::try_from(src[2])?;
    let flags = src[3];
    let message_id = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);
    let body_len = u32::from_le_bytes([src[8], src[9], src[10], src[11]]) as usize;
    let mut dma_raw = [0u8; 8];
    dma_raw.copy_from_slice(&src[12..20]);
    let dma_len = u64::from_le_bytes(dma_raw);

    if body_len > config.max_message_size {
        return Err(FrameError::TooLarge {
            section: "message",
            size: body_len,
            max: config.max_message_size,
        });
    }
    if dma_len > config.max_dma_size as u64 {
        return Err(FrameError::TooLarge {
            section: "DMA payload",
            size: usize::try_from(dma_len).unwrap_or(usize::MAX),
            max: config.max_dma_size,
        });
    }
    let dma_len = dma_len as usize;

    let total = HEADER_SIZE + body_len + dma_len;
    if src.len() < total {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let body = src.split_to(body_len).freeze();
    let dma = src.split_to(dma_len).freeze();

    Ok(Some(LinkFrame {
        kind,
        flags,
        message_id,
        body,
        dma,
    }))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum message section size in bytes. Default: 64 KiB.
    pub max_message_size: usize,
    /// Maximum DMA section size in bytes. Default: 256 MiB.
    pub max_dma_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE,
            max_dma_size: DEFAULT_MAX_DMA,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_message_with_dma() {
        let mut frame = LinkFrame::new(FrameKind::Message, 9, Bytes::from_static(b"header+body"));
        frame.dma = Bytes::from_static(&[1, 2, 3, 4]);
        frame.flags = FLAG_NEEDS_REPLY;

        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();
        assert_eq!(buf.len(), frame.wire_size());

        let decoded = decode_frame(&mut buf, &FrameConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(decoded.kind, FrameKind::Message);
        assert_eq!(decoded.message_id, 9);
        assert!(decoded.has_flag(FLAG_NEEDS_REPLY));
        assert!(!decoded.has_flag(FLAG_CANCELLED));
        assert_eq!(decoded.body.as_ref(), b"header+body");
        assert_eq!(decoded.dma.as_ref(), &[1, 2, 3, 4]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_dma_done_flags() {
        let mut buf = BytesMut::new();
        encode_frame(&LinkFrame::dma_done(4, true), &mut buf).unwrap();
        encode_frame(&LinkFrame::dma_done(5, false), &mut buf).unwrap();

        let cfg = FrameConfig::default();
        let cancelled = decode_frame(&mut buf, &cfg).unwrap().unwrap();
        let completed = decode_frame(&mut buf, &cfg).unwrap().unwrap();

        assert_eq!(cancelled.kind, FrameKind::DmaDone);
        assert_eq!(cancelled.message_id, 4);
        assert!(cancelled.has_flag(FLAG_CANCELLED));
        assert_eq!(completed.message_id, 5);
        assert!(!completed.has_flag(FLAG_CANCELLED));
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x45, 0x43, 0x01][..]);
        let result = decode_frame(&mut buf, &FrameConfig::default()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_decode_incomplete_dma_section() {
        let mut frame = LinkFrame::new(FrameKind::Message, 1, Bytes::from_static(b"m"));
        frame.dma = Bytes::from(vec![7u8; 32]);
        let mut buf = BytesMut::new();
        encode_frame(&frame, &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 1 + 10);

        assert_eq!(peek_frame_len(&buf), Some(HEADER_SIZE + 1 + 32));
        let result = decode_frame(&mut buf, &FrameConfig::default()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_decode_invalid_magic() {
        let mut buf = BytesMut::from(&[0xFFu8; HEADER_SIZE][..]);
        let result = decode_frame(&mut buf, &FrameConfig::default());
        assert!(matches!(result, Err(FrameError::InvalidMagic)));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut buf = BytesMut::new();
        encode_header(FrameKind::Message, 0, 1, 0, 0, &mut buf).unwrap();
        buf[2] = 0x7F;
        let result = decode_frame(&mut buf, &FrameConfig::default());
        assert!(matches!(result, Err(FrameError::UnknownKind(0x7F))));
    }

    #[test]
    fn test_decode_message_too_large() {
        let mut buf = BytesMut::new();
        encode_header(FrameKind::Message, 0, 1, 1024 * 1024, 0, &mut buf).unwrap();

        let result = decode_frame(&mut buf, &FrameConfig::default());
        assert!(matches!(
            result,
            Err(FrameError::TooLarge {
                section: "message",
                ..
            })
        ));
    }

    #[test]
    fn test_decode_dma_too_large() {
        let mut buf = BytesMut::new();
        encode_header(FrameKind::Message, 0, 1, 0, 4096, &mut buf).unwrap();
        let cfg = FrameConfig {
            max_dma_size: 1024,
            ..FrameConfig::default()
        };

        let result = decode_frame(&mut buf, &cfg);
        assert!(matches!(
            result,
            Err(FrameError::TooLarge {
                section: "DMA payload",
                ..
            })
        ));
    }

    #[test]
    fn test_multiple_frames() {
        let mut buf = BytesMut::new();
        encode_frame(&LinkFrame::new(FrameKind::Message, 1, "first"), &mut buf).unwrap();
        encode_frame(&LinkFrame::new(FrameKind::Hello, 0, "second"), &mut buf).unwrap();

        let cfg = FrameConfig::default();
        let f1 = decode_frame(&mut buf, &cfg).unwrap().unwrap();
        assert_eq!(f1.kind, FrameKind::Message);
        assert_eq!(f1.body.as_ref(), b"first");

        let f2 = decode_frame(&mut buf, &cfg).unwrap().unwrap();
        assert_eq!(f2.kind, FrameKind::Hello);
        assert_eq!(f2.body.as_ref(), b"second");

        assert!(buf.is_empty());
    }
}
