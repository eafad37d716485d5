use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use easelcomm_frame::{ChannelId, Message};
use easelcomm_link::UnixLink;
use easelcomm_transport::{
    HardwareBuffer, InboundMessage, Role, ServiceId, Transport, TransportError, WireMessage,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::CommConfig;
use crate::error::{CommError, Result};

/// Per-channel message handler.
///
/// Runs on the receive thread. The endpoint is passed in so a handler can
/// reply, pull payloads or re-register without holding on to it.
pub type Handler = Arc<dyn Fn(&Comm, &Message) + Send + Sync>;

/// Connection lifecycle of a [`Comm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    /// Link lost under [`Comm::open_persistent`], waiting to re-open.
    Reconnecting,
}

/// One endpoint of a link session.
///
/// `Comm` is a cheap handle; clones share the session, the handler table and
/// the receive thread. Handlers are dispatched on that single thread, one at
/// a time, in the order messages arrived, regardless of channel.
///
/// Call [`Comm::close`] to end the session; the receive thread keeps the
/// endpoint alive until then.
#[derive(Clone)]
pub struct Comm {
    inner: Arc<Inner>,
}

struct Inner {
    role: Role,
    config: CommConfig,
    transport: Box<dyn Transport>,
    handlers: Mutex<HashMap<ChannelId, Handler>>,
    state: Mutex<ConnectionState>,
    receive_thread: Mutex<Option<JoinHandle<()>>>,
    receive_thread_id: Mutex<Option<ThreadId>>,
    closing: AtomicBool,
    /// Set while [`Comm::open_persistent`] owns the session.
    persistent: AtomicBool,
    /// Bumped on every successful open and on close; a receive loop only
    /// reacts to the loss of the session it was started for.
    generation: AtomicU64,
}

impl Comm {
    /// Endpoint over a [`UnixLink`] playing `role`.
    pub fn new(role: Role, config: CommConfig) -> Self {
        let link = UnixLink::new(role, config.link.clone());
        Self::with_transport(role, Box::new(link), config)
    }

    /// Endpoint over any transport.
    pub fn with_transport(role: Role, transport: Box<dyn Transport>, config: CommConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                role,
                config,
                transport,
                handlers: Mutex::new(HashMap::new()),
                state: Mutex::new(ConnectionState::Closed),
                receive_thread: Mutex::new(None),
                receive_thread_id: Mutex::new(None),
                closing: AtomicBool::new(false),
                persistent: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.inner.state) = state;
    }

    /// Establish the session for `service`.
    ///
    /// `None` blocks until the peer shows up. Messages are not dispatched
    /// until [`Comm::start_receiving`] is called. Fails with
    /// [`TransportError::AlreadyOpen`] unless the endpoint is closed; the
    /// existing session is left untouched.
    pub fn open(&self, service: ServiceId, timeout: Option<Duration>) -> Result<()> {
        self.claim()?;
        self.inner.closing.store(false, Ordering::Release);
        self.inner.persistent.store(false, Ordering::Release);
        self.connect(service, timeout)
    }

    /// Move `Closed` to `Opening`, refusing any other state.
    fn claim(&self) -> Result<()> {
        let mut state = lock(&self.inner.state);
        if *state != ConnectionState::Closed {
            return Err(TransportError::AlreadyOpen.into());
        }
        *state = ConnectionState::Opening;
        Ok(())
    }

    fn connect(&self, service: ServiceId, timeout: Option<Duration>) -> Result<()> {
        self.set_state(ConnectionState::Opening);
        if let Err(err) = self.inner.transport.open(service, timeout) {
            self.set_state(ConnectionState::Closed);
            return Err(err.into());
        }
        if self.is_closing() {
            self.inner.transport.close();
            self.set_state(ConnectionState::Closed);
            return Err(CommError::NotConnected);
        }
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.set_state(ConnectionState::Open);
        info!(service = %service, role = ?self.inner.role, "session open");
        Ok(())
    }

    /// Keep a session for `service` up until [`Comm::close`] is called.
    ///
    /// Opens without a timeout, receives until the link drops, then closes,
    /// sleeps `retry_delay` and opens again. Returns `Ok` once `close` ends
    /// the session, or the error of an `open` that failed.
    pub fn open_persistent(&self, service: ServiceId, retry_delay: Duration) -> Result<()> {
        self.claim()?;
        self.inner.closing.store(false, Ordering::Release);
        self.inner.persistent.store(true, Ordering::Release);
        let result = self.reconnect_loop(service, retry_delay);
        if self.is_closing() {
            self.set_state(ConnectionState::Closed);
        }
        result
    }

    fn reconnect_loop(&self, service: ServiceId, retry_delay: Duration) -> Result<()> {
        loop {
            if let Err(err) = self.connect(service, None) {
                if self.is_closing() {
                    return Ok(());
                }
                return Err(err);
            }

            self.start_receiving()?;
            self.join_receiving();

            if self.is_closing() {
                return Ok(());
            }
            info!(service = %service, delay = ?retry_delay, "link dropped, reconnecting");
            self.set_state(ConnectionState::Reconnecting);
            self.inner.transport.close();
            thread::sleep(retry_delay);
            if self.is_closing() {
                return Ok(());
            }
        }
    }

    /// Tear the session down and join the receive thread.
    ///
    /// Safe to call repeatedly. Called from a handler it cannot join its own
    /// thread; the thread exits once the handler returns.
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::Release);
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.inner.transport.close();
        self.set_state(ConnectionState::Closed);

        if self.is_receive_thread() {
            return;
        }
        let handle = lock(&self.inner.receive_thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("receive thread panicked");
            }
        }
    }

    fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Install or replace the handler for `channel`.
    pub fn register_handler<F>(&self, channel: ChannelId, handler: F)
    where
        F: Fn(&Comm, &Message) + Send + Sync + 'static,
    {
        self.insert_handler(channel, Arc::new(handler));
    }

    pub(crate) fn insert_handler(&self, channel: ChannelId, handler: Handler) {
        lock(&self.inner.handlers).insert(channel, handler);
    }

    /// Remove the handler for `channel`; returns whether one was installed.
    pub fn unregister_handler(&self, channel: ChannelId) -> bool {
        lock(&self.inner.handlers).remove(&channel).is_some()
    }

    /// Remove the handler for `channel` only if it is still `handler`.
    pub(crate) fn remove_handler_if(&self, channel: ChannelId, handler: &Handler) -> bool {
        let mut handlers = lock(&self.inner.handlers);
        match handlers.get(&channel) {
            Some(current) if Arc::ptr_eq(current, handler) => {
                handlers.remove(&channel);
                true
            }
            _ => false,
        }
    }

    /// Start the receive thread. A no-op while one is already running.
    pub fn start_receiving(&self) -> Result<()> {
        let mut slot = lock(&self.inner.receive_thread);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        if let Some(finished) = slot.take() {
            if finished.join().is_err() {
                warn!("previous receive thread had panicked");
            }
        }

        let comm = self.clone();
        let handle = thread::Builder::new()
            .name(self.inner.config.receive_thread_name.clone())
            .spawn(move || comm.receive_loop())
            .map_err(TransportError::from)?;
        *slot = Some(handle);
        Ok(())
    }

    /// Block until the receive thread exits.
    ///
    /// A panic raised by a handler is re-raised here.
    pub fn join_receiving(&self) {
        if self.is_receive_thread() {
            return;
        }
        let handle = lock(&self.inner.receive_thread).take();
        if let Some(handle) = handle {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
    }

    /// Whether the caller is running on this endpoint's receive thread.
    pub fn is_receive_thread(&self) -> bool {
        *lock(&self.inner.receive_thread_id) == Some(thread::current().id())
    }

    fn receive_loop(self) {
        *lock(&self.inner.receive_thread_id) = Some(thread::current().id());
        let generation = self.inner.generation.load(Ordering::Acquire);
        debug!(role = ?self.inner.role, "receive loop started");

        loop {
            let inbound = match self.inner.transport.receive() {
                Ok(inbound) => inbound,
                Err(err) => {
                    if self.is_closing() {
                        debug!(error = %err, "receive loop stopped by close");
                    } else {
                        self.link_lost(generation, &err);
                    }
                    break;
                }
            };
            self.handle_inbound(inbound);
        }
    }

    /// The peer went away without a local `close`. A one-shot session is
    /// closed for good; a persistent one waits for its reconnect.
    fn link_lost(&self, generation: u64, err: &TransportError) {
        if self.inner.generation.load(Ordering::Acquire) != generation {
            debug!(error = %err, "stale receive loop ended");
            return;
        }
        if self.inner.persistent.load(Ordering::Acquire) {
            info!(error = %err, "link lost");
            self.set_state(ConnectionState::Reconnecting);
        } else {
            warn!(error = %err, "link lost, session closed");
            self.inner.transport.close();
            self.set_state(ConnectionState::Closed);
        }
    }

    fn handle_inbound(&self, inbound: InboundMessage) {
        let message_id = inbound.message_id;
        let dma_size = inbound.dma_size;
        let message = match Message::from_inbound(inbound) {
            Ok(message) => message,
            Err(err) => {
                warn!(message_id, error = %err, "dropping undecodable message");
                if dma_size > 0 {
                    if let Err(err) = self.inner.transport.cancel_receive_dma(message_id) {
                        warn!(message_id, error = %err, "could not discard payload");
                    }
                }
                return;
            }
        };
        self.dispatch(&message);
    }

    fn dispatch(&self, message: &Message) {
        let channel = message.channel();
        // Looked up under the lock, invoked without it.
        let handler = lock(&self.inner.handlers).get(&channel).cloned();
        match handler {
            Some(handler) => {
                debug!(
                    channel,
                    size = message.body_size(),
                    payload = message.has_payload(),
                    "dispatching"
                );
                handler(self, message);
            }
            None => warn!(channel, "no handler registered, dropping message"),
        }

        if message.payload_pending() {
            warn!(channel, "payload left unconsumed by handler, discarding");
            if let Err(err) = self.receive_payload(message, None) {
                warn!(channel, error = %err, "could not discard payload");
            }
        }
    }

    /// Send raw bytes on `channel`.
    ///
    /// With a payload attached this returns only once the peer has pulled or
    /// discarded it.
    pub fn send_raw(
        &self,
        channel: ChannelId,
        body: &[u8],
        payload: Option<&HardwareBuffer>,
    ) -> Result<()> {
        self.transmit(&Message::from_raw(channel, body, payload), payload)
    }

    /// Send text on `channel`.
    pub fn send_string(
        &self,
        channel: ChannelId,
        text: &str,
        payload: Option<&HardwareBuffer>,
    ) -> Result<()> {
        self.transmit(&Message::from_string(channel, text, payload), payload)
    }

    /// Send a serialized record on `channel`.
    pub fn send_record<T: Serialize>(
        &self,
        channel: ChannelId,
        record: &T,
        payload: Option<&HardwareBuffer>,
    ) -> Result<()> {
        let message = Message::from_record(channel, record, payload)?;
        self.transmit(&message, payload)
    }

    pub fn send_ping(&self, channel: ChannelId) -> Result<()> {
        self.transmit(&Message::ping(channel), None)
    }

    /// Send a prebuilt message. `payload` must be the buffer it was built with.
    pub fn send_message(&self, message: &Message, payload: Option<&HardwareBuffer>) -> Result<()> {
        let announced = message.payload().map(|descriptor| descriptor.size);
        let attached = payload.map(HardwareBuffer::size);
        if announced != attached {
            return Err(CommError::InvalidBuffer(format!(
                "message announces payload {announced:?}, attached {attached:?}"
            )));
        }
        self.transmit(message, payload)
    }

    /// Send `buffers` on `channel` one after another, stopping at the first
    /// failure. Returns the id of the last buffer sent.
    pub fn send_buffers(
        &self,
        channel: ChannelId,
        buffers: &[HardwareBuffer],
    ) -> Result<Option<u32>> {
        let mut last_sent = None;
        for buffer in buffers {
            if let Err(err) = self.send_raw(channel, &[], Some(buffer)) {
                return Err(CommError::BatchInterrupted {
                    last_sent,
                    source: Box::new(err),
                });
            }
            last_sent = buffer.id();
        }
        Ok(last_sent)
    }

    fn transmit(&self, message: &Message, payload: Option<&HardwareBuffer>) -> Result<()> {
        if let Some(buffer) = payload {
            if !buffer.is_valid() {
                return Err(CommError::InvalidBuffer(format!("cannot send {buffer:?}")));
            }
        }
        if self.state() != ConnectionState::Open {
            return Err(CommError::NotConnected);
        }

        let wire = WireMessage {
            message: message.as_bytes(),
            dma: payload,
            needs_reply: message.needs_reply(),
            timeout: None,
        };
        self.inner.transport.send(&wire)?;
        debug!(
            channel = message.channel(),
            size = message.body_size(),
            payload = ?payload.map(HardwareBuffer::size),
            "sent"
        );
        Ok(())
    }

    /// Pull the payload of `message` into `dest`, or discard it when `dest`
    /// is `None`.
    ///
    /// The destination must be exactly the payload's size; on mismatch it is
    /// left untouched and the payload stays available.
    pub fn receive_payload(
        &self,
        message: &Message,
        dest: Option<&mut HardwareBuffer>,
    ) -> Result<()> {
        let descriptor = message
            .payload()
            .filter(|descriptor| descriptor.size > 0)
            .ok_or(CommError::NoPayload)?;
        let message_id = message.message_id().ok_or(CommError::NoPayload)?;
        if !message.payload_pending() {
            return Err(CommError::PayloadConsumed);
        }

        match dest {
            None => self.inner.transport.cancel_receive_dma(message_id)?,
            Some(dest) => {
                if dest.size() != descriptor.size {
                    return Err(CommError::PayloadSizeMismatch {
                        expected: descriptor.size,
                        actual: dest.size(),
                    });
                }
                if !dest.is_valid() {
                    return Err(CommError::InvalidBuffer(format!("cannot receive into {dest:?}")));
                }
                self.inner.transport.receive_dma(message_id, dest)?;
                dest.set_id(descriptor.id);
            }
        }
        message.mark_payload_consumed();
        Ok(())
    }
}

impl std::fmt::Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comm")
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .field("channels", &lock(&self.inner.handlers).len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;

    use super::*;

    /// Transport that replays queued inbound messages, then reports a dropped link.
    #[derive(Default)]
    struct Replay {
        inbound: Mutex<VecDeque<InboundMessage>>,
        sent: Mutex<Vec<Vec<u8>>>,
        pulled: Mutex<Vec<u32>>,
        discarded: Mutex<Vec<u32>>,
        open: AtomicBool,
    }

    impl Transport for Replay {
        fn open(
            &self,
            _service: ServiceId,
            _timeout: Option<Duration>,
        ) -> easelcomm_transport::Result<()> {
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn send(&self, message: &WireMessage<'_>) -> easelcomm_transport::Result<()> {
            lock(&self.sent).push(message.message.to_vec());
            Ok(())
        }

        fn receive(&self) -> easelcomm_transport::Result<InboundMessage> {
            lock(&self.inbound)
                .pop_front()
                .ok_or(TransportError::Disconnected)
        }

        fn receive_dma(
            &self,
            message_id: u32,
            dest: &mut HardwareBuffer,
        ) -> easelcomm_transport::Result<()> {
            dest.copy_from_slice(&vec![0x5A; dest.size()])?;
            lock(&self.pulled).push(message_id);
            Ok(())
        }

        fn cancel_receive_dma(&self, message_id: u32) -> easelcomm_transport::Result<()> {
            lock(&self.discarded).push(message_id);
            Ok(())
        }
    }

    fn inbound(message_id: u32, message: &Message, dma_size: usize) -> InboundMessage {
        InboundMessage {
            message_id,
            body: Bytes::copy_from_slice(message.as_bytes()),
            dma_size,
            needs_reply: false,
        }
    }

    fn replay_comm(messages: Vec<InboundMessage>) -> (Comm, Arc<Replay>) {
        let replay = Arc::new(Replay::default());
        lock(&replay.inbound).extend(messages);
        let comm = Comm::with_transport(
            Role::Server,
            Box::new(Arc::clone(&replay)),
            CommConfig::default(),
        );
        (comm, replay)
    }

    #[test]
    fn dispatches_in_arrival_order_across_channels() {
        let messages = vec![
            inbound(1, &Message::from_string(1, "a", None), 0),
            inbound(2, &Message::from_string(2, "b", None), 0),
            inbound(3, &Message::from_string(1, "c", None), 0),
        ];
        let (comm, _replay) = replay_comm(messages);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for channel in [1, 2] {
            let seen = Arc::clone(&seen);
            comm.register_handler(channel, move |_, message| {
                lock(&seen).push(message.as_str().unwrap_or_default().to_string());
            });
        }

        comm.open(ServiceId::TEST, None).unwrap();
        comm.start_receiving().unwrap();
        comm.join_receiving();

        assert_eq!(*lock(&seen), vec!["a", "b", "c"]);
    }

    #[test]
    fn re_registering_replaces_handler() {
        let messages = vec![inbound(1, &Message::ping(4), 0)];
        let (comm, _replay) = replay_comm(messages);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        comm.register_handler(4, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&second);
        comm.register_handler(4, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        comm.open(ServiceId::TEST, None).unwrap();
        comm.start_receiving().unwrap();
        comm.join_receiving();

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(comm.unregister_handler(4));
        assert!(!comm.unregister_handler(4));
    }

    #[test]
    fn unconsumed_payload_is_discarded() {
        let buffer = HardwareBuffer::zeroed(16);
        let messages = vec![
            inbound(7, &Message::from_raw(3, b"", Some(&buffer)), 16),
            inbound(8, &Message::from_raw(9, b"", Some(&buffer)), 16),
        ];
        let (comm, replay) = replay_comm(messages);
        comm.register_handler(3, |_, _| {});

        comm.open(ServiceId::TEST, None).unwrap();
        comm.start_receiving().unwrap();
        comm.join_receiving();

        assert_eq!(*lock(&replay.discarded), vec![7, 8]);
        assert!(lock(&replay.pulled).is_empty());
    }

    #[test]
    fn receive_payload_gating() {
        let buffer = HardwareBuffer::zeroed(8).with_id(2);
        let messages = vec![inbound(5, &Message::from_raw(3, b"", Some(&buffer)), 8)];
        let (comm, replay) = replay_comm(messages);
        let outcome = Arc::new(Mutex::new(Vec::new()));

        let record = Arc::clone(&outcome);
        comm.register_handler(3, move |comm, message| {
            let mut wrong = HardwareBuffer::from_slice(&[1; 4]);
            let mismatch = comm.receive_payload(message, Some(&mut wrong));
            let untouched = wrong.to_vec().unwrap() == vec![1; 4];

            let mut right = HardwareBuffer::zeroed(8);
            let pulled = comm.receive_payload(message, Some(&mut right));
            let again = comm.receive_payload(message, None);

            lock(&record).push((
                matches!(mismatch, Err(CommError::PayloadSizeMismatch { expected: 8, actual: 4 })),
                untouched,
                pulled.is_ok() && right.id() == Some(2),
                matches!(again, Err(CommError::PayloadConsumed)),
            ));
        });

        comm.open(ServiceId::TEST, None).unwrap();
        comm.start_receiving().unwrap();
        comm.join_receiving();

        assert_eq!(*lock(&outcome), vec![(true, true, true, true)]);
        assert_eq!(*lock(&replay.pulled), vec![5]);
        assert!(lock(&replay.discarded).is_empty());
    }

    #[test]
    fn receive_payload_without_payload() {
        let (comm, _replay) = replay_comm(Vec::new());
        let message = Message::from_raw(1, b"no payload", None);
        assert!(matches!(
            comm.receive_payload(&message, None),
            Err(CommError::NoPayload)
        ));
    }

    #[test]
    fn send_requires_open_session() {
        let (comm, replay) = replay_comm(Vec::new());
        assert!(matches!(
            comm.send_string(1, "early", None),
            Err(CommError::NotConnected)
        ));

        comm.open(ServiceId::TEST, None).unwrap();
        comm.send_string(1, "SYNC", None).unwrap();
        comm.send_ping(1).unwrap();
        assert_eq!(lock(&replay.sent).len(), 2);
        comm.close();
        assert_eq!(comm.state(), ConnectionState::Closed);
    }

    #[test]
    fn second_open_leaves_session_intact() {
        let (comm, replay) = replay_comm(Vec::new());
        comm.open(ServiceId::TEST, None).unwrap();

        assert!(matches!(
            comm.open(ServiceId::TEST, None),
            Err(CommError::Transport(TransportError::AlreadyOpen))
        ));
        assert_eq!(comm.state(), ConnectionState::Open);
        assert!(replay.is_open());
        comm.send_string(1, "still here", None).unwrap();
        assert_eq!(lock(&replay.sent).len(), 1);
    }

    #[test]
    fn link_loss_closes_one_shot_session() {
        let messages = vec![inbound(1, &Message::ping(1), 0)];
        let (comm, replay) = replay_comm(messages);
        comm.register_handler(1, |_, _| {});

        comm.open(ServiceId::TEST, None).unwrap();
        comm.start_receiving().unwrap();
        comm.join_receiving();

        assert_eq!(comm.state(), ConnectionState::Closed);
        assert!(!replay.is_open());
        assert!(matches!(comm.send_ping(1), Err(CommError::NotConnected)));
        comm.open(ServiceId::TEST, None).unwrap();
        assert_eq!(comm.state(), ConnectionState::Open);
    }

    #[test]
    fn send_rejects_invalid_or_mismatched_buffers() {
        let (comm, _replay) = replay_comm(Vec::new());
        comm.open(ServiceId::TEST, None).unwrap();

        let empty = HardwareBuffer::zeroed(0);
        assert!(matches!(
            comm.send_raw(1, b"", Some(&empty)),
            Err(CommError::InvalidBuffer(_))
        ));

        let buffer = HardwareBuffer::zeroed(4);
        let message = Message::from_raw(1, b"", Some(&buffer));
        assert!(matches!(
            comm.send_message(&message, None),
            Err(CommError::InvalidBuffer(_))
        ));
        comm.send_message(&message, Some(&buffer)).unwrap();
    }

    #[test]
    fn send_buffers_reports_last_id() {
        let (comm, _replay) = replay_comm(Vec::new());
        comm.open(ServiceId::TEST, None).unwrap();

        let buffers: Vec<_> = (0..3).map(|id| HardwareBuffer::zeroed(4).with_id(id)).collect();
        assert_eq!(comm.send_buffers(1, &buffers).unwrap(), Some(2));
        assert_eq!(comm.send_buffers(1, &[]).unwrap(), None);

        let mixed = vec![
            HardwareBuffer::zeroed(4).with_id(0),
            HardwareBuffer::zeroed(0).with_id(1),
            HardwareBuffer::zeroed(4).with_id(2),
        ];
        match comm.send_buffers(1, &mixed) {
            Err(CommError::BatchInterrupted { last_sent, source }) => {
                assert_eq!(last_sent, Some(0));
                assert!(matches!(*source, CommError::InvalidBuffer(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn close_from_handler_does_not_deadlock() {
        let messages = vec![
            inbound(1, &Message::from_string(1, "bye", None), 0),
            inbound(2, &Message::from_string(1, "bye again", None), 0),
        ];
        let (comm, _replay) = replay_comm(messages);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        comm.register_handler(1, move |comm, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert!(comm.is_receive_thread());
            comm.close();
        });

        comm.open(ServiceId::TEST, None).unwrap();
        comm.start_receiving().unwrap();
        comm.join_receiving();

        assert_eq!(comm.state(), ConnectionState::Closed);
        assert!(!comm.is_receive_thread());
        // Replay ignores close, so the queue still drains.
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[should_panic(expected = "protocol violation")]
    fn handler_panic_resurfaces_in_join() {
        let messages = vec![inbound(1, &Message::ping(1), 0)];
        let (comm, _replay) = replay_comm(messages);
        comm.register_handler(1, |_, _| panic!("protocol violation"));

        comm.open(ServiceId::TEST, None).unwrap();
        comm.start_receiving().unwrap();
        comm.join_receiving();
    }
}
