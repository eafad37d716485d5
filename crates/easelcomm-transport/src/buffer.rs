//! DMA-capable buffer descriptors.
//!
//! A [`HardwareBuffer`] is either memory this process owns (`Local`) or a
//! handle to a region owned by a [`SharedAllocator`] (`Shared`). Shared
//! buffers hold only a weak reference: dropping one never frees the region,
//! and once the allocator releases a region every descriptor pointing at it
//! becomes invalid instead of dangling.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::BytesMut;

use crate::error::{Result, TransportError};

/// Size and id of a DMA payload, without the memory behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadDescriptor {
    /// Payload size in bytes.
    pub size: usize,
    /// Optional ordering id used by multi-buffer transfers.
    pub id: Option<u32>,
}

struct SharedRegion {
    fd: u32,
    data: Mutex<Vec<u8>>,
}

/// Non-owning reference to a region managed by a [`SharedAllocator`].
#[derive(Clone)]
pub struct SharedHandle {
    fd: u32,
    region: Weak<SharedRegion>,
}

impl SharedHandle {
    /// The small integer that identifies the region (the "fd").
    pub fn fd(&self) -> u32 {
        self.fd
    }

    /// True while the allocator still holds the region.
    pub fn is_live(&self) -> bool {
        self.region.strong_count() > 0
    }

    fn upgrade(&self) -> Result<Arc<SharedRegion>> {
        self.region.upgrade().ok_or_else(|| {
            TransportError::InvalidBuffer(format!("shared region {} was released", self.fd))
        })
    }
}

impl fmt::Debug for SharedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHandle")
            .field("fd", &self.fd)
            .field("live", &self.is_live())
            .finish()
    }
}

enum Memory {
    Local(BytesMut),
    Shared(SharedHandle),
}

/// A block of memory usable as a DMA payload.
pub struct HardwareBuffer {
    memory: Memory,
    size: usize,
    id: Option<u32>,
}

impl HardwareBuffer {
    /// Wrap owned memory. The buffer size is the length of `data`.
    pub fn local(data: BytesMut) -> Self {
        let size = data.len();
        Self {
            memory: Memory::Local(data),
            size,
            id: None,
        }
    }

    /// Allocate an owned, zero-filled buffer.
    pub fn zeroed(size: usize) -> Self {
        Self::local(BytesMut::zeroed(size))
    }

    /// Allocate an owned buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::local(BytesMut::from(data))
    }

    /// Describe `size` bytes of a shared region.
    pub fn shared(handle: SharedHandle, size: usize) -> Self {
        Self {
            memory: Memory::Shared(handle),
            size,
            id: None,
        }
    }

    /// Tag the buffer with an ordering id.
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    /// Replace the ordering id.
    pub fn set_id(&mut self, id: Option<u32>) {
        self.id = id;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.memory, Memory::Shared(_))
    }

    /// The shared region fd, if this is a shared buffer.
    pub fn shared_fd(&self) -> Option<u32> {
        match &self.memory {
            Memory::Shared(handle) => Some(handle.fd),
            Memory::Local(_) => None,
        }
    }

    /// A buffer is valid when it is non-empty and its memory is reachable.
    pub fn is_valid(&self) -> bool {
        if self.size == 0 {
            return false;
        }
        match &self.memory {
            Memory::Local(data) => data.len() == self.size,
            Memory::Shared(handle) => match handle.region.upgrade() {
                Some(region) => {
                    let len = lock(&region.data).len();
                    len >= self.size
                }
                None => false,
            },
        }
    }

    /// Size and id only.
    pub fn descriptor(&self) -> PayloadDescriptor {
        PayloadDescriptor {
            size: self.size,
            id: self.id,
        }
    }

    /// Run `f` over the buffer contents.
    pub fn read_with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.ensure_valid()?;
        match &self.memory {
            Memory::Local(data) => Ok(f(&data[..self.size])),
            Memory::Shared(handle) => {
                let region = handle.upgrade()?;
                let data = lock(&region.data);
                Ok(f(&data[..self.size]))
            }
        }
    }

    /// Overwrite the buffer contents. `src` must be exactly `size()` bytes.
    pub fn copy_from_slice(&mut self, src: &[u8]) -> Result<()> {
        self.ensure_valid()?;
        if src.len() != self.size {
            return Err(TransportError::InvalidBuffer(format!(
                "source is {} bytes, buffer is {}",
                src.len(),
                self.size
            )));
        }
        match &mut self.memory {
            Memory::Local(data) => data[..src.len()].copy_from_slice(src),
            Memory::Shared(handle) => {
                let region = handle.upgrade()?;
                let mut data = lock(&region.data);
                data[..src.len()].copy_from_slice(src);
            }
        }
        Ok(())
    }

    /// Copy the contents out.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.read_with(<[u8]>::to_vec)
    }

    /// Borrow owned memory directly. `None` for shared buffers.
    pub fn as_local(&self) -> Option<&[u8]> {
        match &self.memory {
            Memory::Local(data) => Some(&data[..]),
            Memory::Shared(_) => None,
        }
    }

    /// Mutably borrow owned memory directly. `None` for shared buffers.
    pub fn as_local_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.memory {
            Memory::Local(data) => Some(&mut data[..]),
            Memory::Shared(_) => None,
        }
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(TransportError::InvalidBuffer(format!(
                "unusable buffer (size {}, shared {})",
                self.size,
                self.is_shared()
            )))
        }
    }
}

impl fmt::Debug for HardwareBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("HardwareBuffer");
        match &self.memory {
            Memory::Local(_) => dbg.field("kind", &"local"),
            Memory::Shared(handle) => dbg.field("kind", &"shared").field("fd", &handle.fd),
        };
        dbg.field("size", &self.size).field("id", &self.id).finish()
    }
}

/// Arena of shared regions addressed by small integer fds.
///
/// Stands in for the platform's shareable-memory allocator: it owns every
/// region, and only hands out [`SharedHandle`]s.
pub struct SharedAllocator {
    regions: Mutex<HashMap<u32, Arc<SharedRegion>>>,
    next_fd: AtomicU32,
}

impl SharedAllocator {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(HashMap::new()),
            next_fd: AtomicU32::new(1),
        }
    }

    /// Allocate a zero-filled region and return a buffer describing all of it.
    pub fn allocate(&self, size: usize) -> Result<HardwareBuffer> {
        if size == 0 {
            return Err(TransportError::InvalidBuffer(
                "cannot allocate an empty shared region".to_string(),
            ));
        }
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        let region = Arc::new(SharedRegion {
            fd,
            data: Mutex::new(vec![0u8; size]),
        });
        let handle = SharedHandle {
            fd: region.fd,
            region: Arc::downgrade(&region),
        };
        lock(&self.regions).insert(fd, region);
        Ok(HardwareBuffer::shared(handle, size))
    }

    /// Describe an existing region by fd.
    pub fn lookup(&self, fd: u32) -> Option<HardwareBuffer> {
        let regions = lock(&self.regions);
        let region = regions.get(&fd)?;
        let size = lock(&region.data).len();
        let handle = SharedHandle {
            fd,
            region: Arc::downgrade(region),
        };
        Some(HardwareBuffer::shared(handle, size))
    }

    /// Free a region. Outstanding descriptors become invalid.
    pub fn release(&self, fd: u32) -> bool {
        lock(&self.regions).remove(&fd).is_some()
    }

    /// Number of live regions.
    pub fn len(&self) -> usize {
        lock(&self.regions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SharedAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
