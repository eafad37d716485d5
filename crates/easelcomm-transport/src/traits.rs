use std::io::{Read, Write};
use std::net::Shutdown;
use std::time::Duration;

use bytes::Bytes;

use crate::buffer::HardwareBuffer;
use crate::error::Result;
use crate::service::ServiceId;

/// Which end of the link an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates sessions (the application processor side).
    Client,
    /// Waits for sessions (the coprocessor side).
    Server,
}

/// One outbound message as handed to the link driver.
#[derive(Debug, Clone, Copy)]
pub struct WireMessage<'a> {
    /// Encoded message (header + body).
    pub message: &'a [u8],
    /// Optional DMA payload transferred by reference.
    pub dma: Option<&'a HardwareBuffer>,
    /// Whether the sender expects a reply correlated to this message.
    pub needs_reply: bool,
    /// Bound on how long the DMA rendezvous may take. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl<'a> WireMessage<'a> {
    pub fn new(message: &'a [u8]) -> Self {
        Self {
            message,
            dma: None,
            needs_reply: false,
            timeout: None,
        }
    }

    pub fn with_dma(mut self, dma: &'a HardwareBuffer) -> Self {
        self.dma = Some(dma);
        self
    }
}

/// One message delivered by the link driver.
///
/// Only the size of an announced DMA payload is known here; its bytes stay
/// with the driver until [`Transport::receive_dma`] or
/// [`Transport::cancel_receive_dma`] is called with `message_id`.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Driver-assigned id, used to pull or discard the DMA payload.
    pub message_id: u32,
    /// Encoded message (header + body).
    pub body: Bytes,
    /// Size of the announced DMA payload, 0 if none.
    pub dma_size: usize,
    /// Whether the sender expects a reply.
    pub needs_reply: bool,
}

/// Capability implemented by every link driver.
///
/// All methods take `&self`: a receive thread blocks in [`Transport::receive`]
/// while other threads send on the same session.
pub trait Transport: Send + Sync {
    /// Establish the session for `service`. `None` blocks until it exists.
    fn open(&self, service: ServiceId, timeout: Option<Duration>) -> Result<()>;

    /// Tear the session down. Safe to call when already closed.
    fn close(&self);

    /// Whether a session is currently established.
    fn is_open(&self) -> bool;

    /// Send a message. With a DMA payload attached this returns only once
    /// the remote side has pulled or discarded the payload.
    fn send(&self, message: &WireMessage<'_>) -> Result<()>;

    /// Block until the next message arrives.
    fn receive(&self) -> Result<InboundMessage>;

    /// Pull the payload announced by `message_id` into `dest`.
    fn receive_dma(&self, message_id: u32, dest: &mut HardwareBuffer) -> Result<()>;

    /// Discard the payload announced by `message_id`.
    fn cancel_receive_dma(&self, message_id: u32) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn open(&self, service: ServiceId, timeout: Option<Duration>) -> Result<()> {
        (**self).open(service, timeout)
    }

    fn close(&self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn send(&self, message: &WireMessage<'_>) -> Result<()> {
        (**self).send(message)
    }

    fn receive(&self) -> Result<InboundMessage> {
        (**self).receive()
    }

    fn receive_dma(&self, message_id: u32, dest: &mut HardwareBuffer) -> Result<()> {
        (**self).receive_dma(message_id, dest)
    }

    fn cancel_receive_dma(&self, message_id: u32) -> Result<()> {
        (**self).cancel_receive_dma(message_id)
    }
}

/// A connected byte stream (Read + Write).
///
/// On Unix this wraps a Unix domain socket stream.
pub struct IpcStream {
    inner: std::os::unix::net::UnixStream,
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl IpcStream {
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self { inner: stream }
    }

    /// Connected pair, for tests and in-process links.
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout).map_err(Into::into)
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_write_timeout(timeout).map_err(Into::into)
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        let cloned = self.inner.try_clone()?;
        Ok(Self::from_unix(cloned))
    }

    /// Shut down both directions. Blocked readers on any clone see EOF.
    pub fn shutdown(&self) -> Result<()> {
        match self.inner.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcStream").field("type", &"unix").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_unblocks_reader_clone() {
        let (left, _right) = IpcStream::pair().unwrap();
        let mut reader = left.try_clone().unwrap();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read(&mut buf).unwrap()
        });

        left.shutdown().unwrap();
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn shutdown_twice_is_ok() {
        let (left, _right) = IpcStream::pair().unwrap();
        left.shutdown().unwrap();
        left.shutdown().unwrap();
    }

    #[test]
    fn wire_message_builder() {
        let buffer = HardwareBuffer::from_slice(b"dma");
        let wire = WireMessage::new(b"msg").with_dma(&buffer);
        assert_eq!(wire.message, b"msg");
        assert_eq!(wire.dma.map(HardwareBuffer::size), Some(3));
        assert!(!wire.needs_reply);
        assert!(wire.timeout.is_none());
    }
}
