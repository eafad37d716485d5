use easelcomm_transport::HardwareBuffer;
use tracing::error;

/// Outcome of feeding one buffer into an [`Assembly`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More buffers are expected.
    Pending,
    /// The buffer just accepted was the last one.
    Complete,
}

/// A logical object (model or request) being rebuilt from its metadata and
/// an ordered run of buffer-carrying messages.
///
/// Buffers must arrive with ids `0..N` in order and each must match the size
/// declared for its slot. Anything else means the peers disagree about the
/// buffer table, which [`accept`](Self::accept) treats as fatal.
#[derive(Debug)]
pub struct Assembly {
    declared: Vec<usize>,
    slots: Vec<Option<HardwareBuffer>>,
    received: usize,
}

impl Assembly {
    pub fn new(declared: Vec<usize>) -> Self {
        let slots = declared.iter().map(|_| None).collect();
        Self {
            declared,
            slots,
            received: 0,
        }
    }

    pub fn declared(&self) -> &[usize] {
        &self.declared
    }

    pub fn received(&self) -> usize {
        self.received
    }

    /// True once every declared buffer is in. An object that declares no
    /// buffers is complete from the start.
    pub fn is_complete(&self) -> bool {
        self.received == self.declared.len()
    }

    /// Accept buffer `id` of `size` bytes.
    ///
    /// A zeroed buffer of the declared size is allocated and handed to
    /// `pull`, which fills it (normally via `Comm::receive_payload`). A pull
    /// failure is returned and the slot stays empty.
    ///
    /// # Panics
    ///
    /// If the assembly is already complete, `id` is not the next expected
    /// id, or `size` differs from the size declared for that slot.
    pub fn accept<E>(
        &mut self,
        id: u32,
        size: usize,
        pull: impl FnOnce(&mut HardwareBuffer) -> Result<(), E>,
    ) -> Result<Progress, E> {
        if self.is_complete() {
            protocol_violation(format!(
                "buffer {id} arrived after all {} buffers were received",
                self.declared.len()
            ));
        }
        if id as usize != self.received {
            protocol_violation(format!(
                "buffer id {id} out of order, expected {}",
                self.received
            ));
        }
        let declared = self.declared[self.received];
        if size != declared {
            protocol_violation(format!(
                "buffer {id} carries {size} bytes, {declared} were declared"
            ));
        }

        let mut buffer = HardwareBuffer::zeroed(declared).with_id(id);
        pull(&mut buffer)?;
        self.slots[self.received] = Some(buffer);
        self.received += 1;

        Ok(if self.is_complete() {
            Progress::Complete
        } else {
            Progress::Pending
        })
    }

    /// Take the buffers out, in id order.
    ///
    /// # Panics
    ///
    /// If the assembly is not complete.
    pub fn into_buffers(self) -> Vec<HardwareBuffer> {
        if !self.is_complete() {
            protocol_violation(format!(
                "assembly consumed with {} of {} buffers",
                self.received,
                self.declared.len()
            ));
        }
        self.slots.into_iter().flatten().collect()
    }
}

/// Log and abort on a desynchronized peer.
pub(crate) fn protocol_violation(detail: String) -> ! {
    error!(%detail, "protocol violation");
    panic!("protocol violation: {detail}");
}
