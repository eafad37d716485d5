use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use easelcomm_transport::IpcStream;

use crate::codec::{decode_frame, peek_frame_len, FrameConfig, LinkFrame};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Reads complete link frames from any `Read` stream.
///
/// Handles partial reads internally; callers always get complete frames.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_frame(&mut self) -> Result<LinkFrame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, &self.config)? {
                return Ok(frame);
            }

            // Large DMA sections arrive in many chunks; grow once, not per chunk.
            if let Some(total) = peek_frame_len(&self.buf) {
                if total > self.buf.capacity() {
                    self.buf.reserve(total - self.buf.len());
                }
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<IpcStream> {
    /// Create a frame reader for `IpcStream` and apply read timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(FrameError::Buffer)?;
        Ok(Self::with_config(inner, config))
    }

    /// Change the read timeout on the underlying stream.
    pub fn set_read_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.config.read_timeout = timeout;
        self.inner
            .set_read_timeout(timeout)
            .map_err(FrameError::Buffer)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::{BufMut, Bytes, BytesMut};

    use super::*;
    use crate::codec::{encode_frame, encode_header, FrameKind, MAGIC};

    fn wire(frames: &[LinkFrame]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for frame in frames {
            encode_frame(frame, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn read_single_frame() {
        let bytes = wire(&[LinkFrame::new(FrameKind::Message, 3, "hello")]);

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.kind, FrameKind::Message);
        assert_eq!(frame.message_id, 3);
        assert_eq!(frame.body.as_ref(), b"hello");
    }

    #[test]
    fn read_multiple_frames() {
        let bytes = wire(&[
            LinkFrame::new(FrameKind::Message, 1, "one"),
            LinkFrame::dma_done(1, false),
            LinkFrame::new(FrameKind::Message, 2, "three"),
        ]);

        let mut reader = FrameReader::new(Cursor::new(bytes));

        let f1 = reader.read_frame().unwrap();
        let f2 = reader.read_frame().unwrap();
        let f3 = reader.read_frame().unwrap();

        assert_eq!((f1.kind, f1.body.as_ref()), (FrameKind::Message, b"one".as_ref()));
        assert_eq!((f2.kind, f2.message_id), (FrameKind::DmaDone, 1));
        assert_eq!((f3.kind, f3.body.as_ref()), (FrameKind::Message, b"three".as_ref()));
    }

    #[test]
    fn read_frame_with_large_dma_section() {
        let dma = vec![0xAB; 512 * 1024];
        let mut frame = LinkFrame::new(FrameKind::Message, 9, "m");
        frame.dma = Bytes::from(dma.clone());

        let mut reader = FrameReader::new(Cursor::new(wire(&[frame])));
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.message_id, 9);
        assert_eq!(frame.dma.as_ref(), dma.as_slice());
    }

    #[test]
    fn partial_read_handling() {
        let byte_reader = ByteByByteReader {
            bytes: wire(&[LinkFrame::new(FrameKind::Message, 4, "slow")]),
            pos: 0,
        };
        let mut reader = FrameReader::new(byte_reader);

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.message_id, 4);
        assert_eq!(frame.body.as_ref(), b"slow");
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_frame() {
        let mut partial = BytesMut::new();
        encode_header(FrameKind::Message, 0, 2, 16, 0, &mut partial).unwrap();
        partial.put_slice(b"only-part");

        let mut reader = FrameReader::new(Cursor::new(partial.to_vec()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn invalid_magic_in_stream() {
        let mut bytes = vec![0u8; crate::codec::HEADER_SIZE];
        bytes[0] = MAGIC[1];
        let mut reader = FrameReader::new(Cursor::new(bytes));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::InvalidMagic));
    }

    #[test]
    fn interrupted_read_retries() {
        let reader = InterruptedThenData {
            interrupted: false,
            bytes: wire(&[LinkFrame::new(FrameKind::Hello, 0, "ok")]),
            pos: 0,
        };
        let mut framed = FrameReader::new(reader);
        let frame = framed.read_frame().unwrap();

        assert_eq!(frame.kind, FrameKind::Hello);
        assert_eq!(frame.body.as_ref(), b"ok");
    }

    #[test]
    fn roundtrip_over_socket_pair() {
        let (left, right) = IpcStream::pair().unwrap();
        let mut writer = crate::writer::FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        writer.send_message(1, 0, b"ping", None).unwrap();
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.message_id, 1);
        assert_eq!(frame.body.as_ref(), b"ping");
        assert!(frame.dma.is_empty());
    }

    #[derive(Debug)]
    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedThenData {
        interrupted: bool,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            let remaining = self.bytes.len() - self.pos;
            let n = remaining.min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }
}
