use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use easelcomm_frame::{
    FrameConfig, FrameError, FrameKind, FrameReader, FrameWriter, LinkFrame, FLAG_CANCELLED,
    FLAG_NEEDS_REPLY,
};
use easelcomm_transport::{
    HardwareBuffer, InboundMessage, IpcStream, Role, ServiceId, Transport, TransportError,
    UnixDomainSocket, WireMessage,
};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::handshake::{handshake_client, handshake_server};

type Result<T> = std::result::Result<T, TransportError>;

/// How often a blocked `open` checks whether `close` was called.
const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Link driver over a Unix domain socket.
///
/// The server role binds `<socket_dir>/service-<id>.sock` and accepts one
/// peer, unlinking the socket once it has; the client role connects to it.
/// After the handshake a reader thread owns the receive half of the socket:
///
/// - message frames are queued for [`Transport::receive`], their DMA section
///   staged under the frame's message id;
/// - DMA_DONE frames release the sender blocked in [`Transport::send`].
///
/// Because the reader thread never runs user code, a caller may send with a
/// payload from inside its own receive loop without deadlocking.
pub struct UnixLink {
    role: Role,
    config: LinkConfig,
    connection: Mutex<Option<Arc<Connection>>>,
    closing: AtomicBool,
}

impl UnixLink {
    pub fn new(role: Role, config: LinkConfig) -> Self {
        Self {
            role,
            config,
            connection: Mutex::new(None),
            closing: AtomicBool::new(false),
        }
    }

    /// Client end (the application processor side).
    pub fn client(config: LinkConfig) -> Self {
        Self::new(Role::Client, config)
    }

    /// Server end (the coprocessor side).
    pub fn server(config: LinkConfig) -> Self {
        Self::new(Role::Server, config)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Service of the current session, if one is established.
    pub fn service(&self) -> Option<ServiceId> {
        lock(&self.connection).as_ref().map(|conn| conn.service)
    }

    fn current(&self) -> Result<Arc<Connection>> {
        lock(&self.connection)
            .as_ref()
            .map(Arc::clone)
            .ok_or(TransportError::NotConnected)
    }

    fn establish(
        &self,
        service: ServiceId,
        timeout: Option<Duration>,
    ) -> Result<IpcStream> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let path = self.config.socket_path(service);

        match self.role {
            Role::Server => {
                std::fs::create_dir_all(&self.config.socket_dir)?;
                let listener = UnixDomainSocket::bind(&path)?;
                info!(service = %service, path = ?path, "listening for link peer");
                loop {
                    match listener.accept_timeout(Some(self.poll_slice(deadline, timeout)?)) {
                        // One peer per session: dropping the listener here
                        // removes the socket file until the next `open`.
                        Ok(stream) => return Ok(stream),
                        Err(TransportError::Timeout(_)) => continue,
                        Err(err) => return Err(err),
                    }
                }
            }
            Role::Client => loop {
                let slice = self.poll_slice(deadline, timeout)?;
                match UnixDomainSocket::connect_with_retry(
                    &path,
                    Some(slice),
                    self.config.connect_retry_interval,
                ) {
                    Ok(stream) => return Ok(stream),
                    Err(TransportError::Timeout(_)) => continue,
                    Err(err) => return Err(err),
                }
            },
        }
    }

    /// Next wait slice for `establish`, or why waiting must stop.
    fn poll_slice(&self, deadline: Option<Instant>, timeout: Option<Duration>) -> Result<Duration> {
        if self.closing.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        match (deadline, timeout) {
            (Some(deadline), Some(timeout)) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(TransportError::Timeout(timeout));
                }
                Ok(remaining.min(OPEN_POLL_INTERVAL))
            }
            _ => Ok(OPEN_POLL_INTERVAL),
        }
    }

    fn handshake(
        &self,
        stream: IpcStream,
        service: ServiceId,
    ) -> Result<(FrameReader<IpcStream>, FrameWriter<IpcStream>)> {
        let frame_config = self.config.frame.clone();
        let handshake_config = &self.config.handshake;
        let during = FrameConfig {
            read_timeout: Some(handshake_config.timeout),
            write_timeout: Some(handshake_config.timeout),
            ..frame_config.clone()
        };

        let reader_stream = stream.try_clone()?;
        let mut reader =
            FrameReader::with_config_ipc(reader_stream, during.clone()).map_err(link_error)?;
        let mut writer = FrameWriter::with_config_ipc(stream, during).map_err(link_error)?;

        match self.role {
            Role::Client => handshake_client(&mut reader, &mut writer, service, handshake_config)?,
            Role::Server => handshake_server(&mut reader, &mut writer, service, handshake_config)?,
        };

        // Runtime timeouts replace the handshake bound.
        reader
            .set_read_timeout(frame_config.read_timeout)
            .map_err(link_error)?;
        writer
            .set_write_timeout(frame_config.write_timeout)
            .map_err(link_error)?;
        Ok((reader, writer))
    }
}

impl Transport for UnixLink {
    fn open(&self, service: ServiceId, timeout: Option<Duration>) -> Result<()> {
        if lock(&self.connection).is_some() {
            return Err(TransportError::AlreadyOpen);
        }
        self.closing.store(false, Ordering::Release);

        let stream = self.establish(service, timeout)?;
        let (reader, writer) = self.handshake(stream, service)?;
        let control = writer.get_ref().try_clone()?;

        let shared = Arc::new(Shared::default());
        let (inbox_tx, inbox_rx) = mpsc::channel();
        let reader_shared = Arc::clone(&shared);
        let reader_thread = thread::Builder::new()
            .name(format!("easelcomm-link-{}", service.as_u32()))
            .spawn(move || run_reader(reader, reader_shared, inbox_tx, service))?;

        let conn = Arc::new(Connection {
            service,
            writer: Mutex::new(writer),
            control,
            inbox: Mutex::new(inbox_rx),
            shared,
            next_message_id: AtomicU32::new(1),
            reader_thread: Mutex::new(Some(reader_thread)),
        });

        let mut slot = lock(&self.connection);
        if slot.is_some() || self.closing.load(Ordering::Acquire) {
            drop(slot);
            conn.shutdown();
            return Err(TransportError::NotConnected);
        }
        *slot = Some(conn);
        info!(service = %service, role = ?self.role, "link open");
        Ok(())
    }

    fn close(&self) {
        self.closing.store(true, Ordering::Release);
        let Some(conn) = lock(&self.connection).take() else {
            return;
        };
        conn.shutdown();
        info!(service = %conn.service, role = ?self.role, "link closed");
    }

    fn is_open(&self) -> bool {
        lock(&self.connection)
            .as_ref()
            .is_some_and(|conn| !conn.shared.is_closed())
    }

    fn send(&self, message: &WireMessage<'_>) -> Result<()> {
        let conn = self.current()?;
        let message_id = conn.next_message_id.fetch_add(1, Ordering::Relaxed);
        let flags = if message.needs_reply { FLAG_NEEDS_REPLY } else { 0 };

        let waiter = match message.dma {
            Some(_) => Some(conn.shared.expect_dma_done(message_id)?),
            None => None,
        };

        let written =
            lock(&conn.writer).send_message(message_id, flags, message.message, message.dma);
        if let Err(err) = written {
            conn.shared.forget_waiter(message_id);
            return Err(link_error(err));
        }

        let Some(waiter) = waiter else {
            return Ok(());
        };
        let outcome = match message.timeout {
            None => waiter.recv().map_err(|_| TransportError::Disconnected)?,
            Some(timeout) => match waiter.recv_timeout(timeout) {
                Ok(outcome) => outcome,
                Err(RecvTimeoutError::Timeout) => {
                    conn.shared.forget_waiter(message_id);
                    return Err(TransportError::Timeout(timeout));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Disconnected),
            },
        };
        match outcome {
            DmaOutcome::Done => debug!(message_id, "DMA pulled by peer"),
            DmaOutcome::Cancelled => debug!(message_id, "DMA discarded by peer"),
        }
        Ok(())
    }

    fn receive(&self) -> Result<InboundMessage> {
        let conn = self.current()?;
        let inbox = lock(&conn.inbox);
        inbox.recv().map_err(|_| TransportError::Disconnected)
    }

    fn receive_dma(&self, message_id: u32, dest: &mut HardwareBuffer) -> Result<()> {
        let conn = self.current()?;
        let staged = conn
            .shared
            .staged(message_id)
            .ok_or(TransportError::NoPendingDma(message_id))?;
        if staged.len() != dest.size() {
            return Err(TransportError::InvalidBuffer(format!(
                "destination holds {} bytes, payload of message {message_id} has {}",
                dest.size(),
                staged.len()
            )));
        }
        dest.copy_from_slice(&staged)?;
        conn.shared.unstage(message_id);

        lock(&conn.writer)
            .send_dma_done(message_id, false)
            .map_err(link_error)?;
        debug!(message_id, size = staged.len(), "DMA received");
        Ok(())
    }

    fn cancel_receive_dma(&self, message_id: u32) -> Result<()> {
        let conn = self.current()?;
        let staged = conn
            .shared
            .unstage(message_id)
            .ok_or(TransportError::NoPendingDma(message_id))?;

        lock(&conn.writer)
            .send_dma_done(message_id, true)
            .map_err(link_error)?;
        debug!(message_id, size = staged.len(), "DMA discarded");
        Ok(())
    }
}

impl Drop for UnixLink {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for UnixLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixLink")
            .field("role", &self.role)
            .field("socket_dir", &self.config.socket_dir)
            .field("service", &self.service())
            .finish()
    }
}

/// One established session.
struct Connection {
    service: ServiceId,
    writer: Mutex<FrameWriter<IpcStream>>,
    /// Clone of the socket used only to shut it down.
    control: IpcStream,
    inbox: Mutex<Receiver<InboundMessage>>,
    shared: Arc<Shared>,
    next_message_id: AtomicU32,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    fn shutdown(&self) {
        if let Err(err) = self.control.shutdown() {
            debug!(service = %self.service, error = %err, "socket shutdown failed");
        }
        if let Some(handle) = lock(&self.reader_thread).take() {
            if handle.join().is_err() {
                warn!(service = %self.service, "link reader thread panicked");
            }
        }
        self.shared.close();
    }
}

/// Outcome reported by the peer's DMA_DONE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DmaOutcome {
    Done,
    Cancelled,
}

/// State shared between the reader thread and callers.
#[derive(Default)]
struct Shared {
    staged: Mutex<HashMap<u32, Bytes>>,
    waiters: Mutex<Waiters>,
}

#[derive(Default)]
struct Waiters {
    pending: HashMap<u32, SyncSender<DmaOutcome>>,
    closed: bool,
}

impl Shared {
    fn expect_dma_done(&self, message_id: u32) -> Result<Receiver<DmaOutcome>> {
        let mut waiters = lock(&self.waiters);
        if waiters.closed {
            return Err(TransportError::Disconnected);
        }
        let (tx, rx) = mpsc::sync_channel(1);
        waiters.pending.insert(message_id, tx);
        Ok(rx)
    }

    fn forget_waiter(&self, message_id: u32) {
        lock(&self.waiters).pending.remove(&message_id);
    }

    fn complete(&self, message_id: u32, outcome: DmaOutcome) {
        match lock(&self.waiters).pending.remove(&message_id) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => warn!(message_id, "DMA_DONE for a message nobody is waiting on"),
        }
    }

    fn stage(&self, message_id: u32, payload: Bytes) {
        lock(&self.staged).insert(message_id, payload);
    }

    fn staged(&self, message_id: u32) -> Option<Bytes> {
        lock(&self.staged).get(&message_id).cloned()
    }

    fn unstage(&self, message_id: u32) -> Option<Bytes> {
        lock(&self.staged).remove(&message_id)
    }

    fn is_closed(&self) -> bool {
        lock(&self.waiters).closed
    }

    /// Fail every blocked sender and drop staged payloads.
    fn close(&self) {
        let mut waiters = lock(&self.waiters);
        waiters.closed = true;
        waiters.pending.clear();
        drop(waiters);
        lock(&self.staged).clear();
    }
}

fn run_reader(
    mut reader: FrameReader<IpcStream>,
    shared: Arc<Shared>,
    inbox: Sender<InboundMessage>,
    service: ServiceId,
) {
    loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(FrameError::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(FrameError::ConnectionClosed) => {
                info!(service = %service, "link peer disconnected");
                break;
            }
            Err(err) => {
                warn!(service = %service, error = %err, "link read failed");
                break;
            }
        };

        match frame.kind {
            FrameKind::Message => deliver(frame, &shared, &inbox),
            FrameKind::DmaDone => {
                let outcome = if frame.has_flag(FLAG_CANCELLED) {
                    DmaOutcome::Cancelled
                } else {
                    DmaOutcome::Done
                };
                shared.complete(frame.message_id, outcome);
            }
            FrameKind::Hello => {
                warn!(service = %service, "unexpected HELLO after handshake, ignoring");
            }
        }
    }
    // Senders blocked on a rendezvous must not wait for a peer that is gone.
    shared.close();
}

fn deliver(frame: LinkFrame, shared: &Shared, inbox: &Sender<InboundMessage>) {
    let message_id = frame.message_id;
    let dma_size = frame.dma.len();
    if dma_size > 0 {
        shared.stage(message_id, frame.dma);
    }
    let inbound = InboundMessage {
        message_id,
        body: frame.body,
        dma_size,
        needs_reply: frame.flags & FLAG_NEEDS_REPLY != 0,
    };
    if inbox.send(inbound).is_err() {
        debug!(message_id, "link receiver gone, message dropped");
    }
}

/// Collapse frame-layer failures into the transport taxonomy.
fn link_error(err: FrameError) -> TransportError {
    match err {
        FrameError::ConnectionClosed => TransportError::Disconnected,
        FrameError::Buffer(err) => err,
        FrameError::Io(err)
            if matches!(
                err.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            ) =>
        {
            TransportError::Disconnected
        }
        FrameError::Io(err) => TransportError::Io(err),
        other => TransportError::Protocol(other.to_string()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
