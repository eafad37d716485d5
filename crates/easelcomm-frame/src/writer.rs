use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use easelcomm_transport::{HardwareBuffer, IpcStream};

use crate::codec::{encode_header, FrameConfig, FrameKind, LinkFrame};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete link frames to any `Write` stream.
///
/// DMA sections are streamed straight from the source buffer; only the
/// header and message section go through the internal scratch buffer.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write a complete frame (blocking).
    pub fn write_frame(&mut self, frame: &LinkFrame) -> Result<()> {
        self.check_sizes(frame.body.len(), frame.dma.len())?;
        self.write_head(
            frame.kind,
            frame.flags,
            frame.message_id,
            &frame.body,
            frame.dma.len(),
        )?;
        write_all(&mut self.inner, &frame.dma)?;
        self.flush()
    }

    /// Send a channel message, streaming `dma` behind it when present.
    pub fn send_message(
        &mut self,
        message_id: u32,
        flags: u8,
        message: &[u8],
        dma: Option<&HardwareBuffer>,
    ) -> Result<()> {
        let dma_len = dma.map_or(0, HardwareBuffer::size);
        self.check_sizes(message.len(), dma_len)?;
        if let Some(buffer) = dma {
            // Fail before anything hits the wire.
            if !buffer.is_valid() {
                return Err(FrameError::Buffer(
                    easelcomm_transport::TransportError::InvalidBuffer(format!(
                        "cannot send {buffer:?}"
                    )),
                ));
            }
        }

        self.write_head(FrameKind::Message, flags, message_id, message, dma_len)?;
        if let Some(buffer) = dma {
            let inner = &mut self.inner;
            buffer.read_with(|bytes| write_all(inner, bytes))??;
        }
        self.flush()
    }

    /// Acknowledge (or cancel) the DMA announced by `message_id`.
    pub fn send_dma_done(&mut self, message_id: u32, cancelled: bool) -> Result<()> {
        self.write_frame(&LinkFrame::dma_done(message_id, cancelled))
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    fn check_sizes(&self, message_len: usize, dma_len: usize) -> Result<()> {
        if message_len > self.config.max_message_size {
            return Err(FrameError::TooLarge {
                section: "message",
                size: message_len,
                max: self.config.max_message_size,
            });
        }
        if dma_len > self.config.max_dma_size {
            return Err(FrameError::TooLarge {
                section: "DMA payload",
                size: dma_len,
                max: self.config.max_dma_size,
            });
        }
        Ok(())
    }

    fn write_head(
        &mut self,
        kind: FrameKind,
        flags: u8,
        message_id: u32,
        message: &[u8],
        dma_len: usize,
    ) -> Result<()> {
        self.buf.clear();
        encode_header(kind, flags, message_id, message.len(), dma_len, &mut self.buf)?;
        self.buf.extend_from_slice(message);
        write_all(&mut self.inner, &self.buf)
    }
}

impl FrameWriter<IpcStream> {
    /// Create a frame writer for `IpcStream` and apply write timeout from config.
    pub fn with_config_ipc(inner: IpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(FrameError::Buffer)?;
        Ok(Self::with_config(inner, config))
    }

    /// Change the write timeout on the underlying stream.
    pub fn set_write_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.config.write_timeout = timeout;
        self.inner
            .set_write_timeout(timeout)
            .map_err(FrameError::Buffer)
    }
}

fn write_all<T: Write>(inner: &mut T, bytes: &[u8]) -> Result<()> {
    let mut offset = 0usize;
    while offset < bytes.len() {
        match inner.write(&bytes[offset..]) {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => offset += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(())
}
