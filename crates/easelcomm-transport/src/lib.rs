//! Link transport abstraction for easelcomm.
//!
//! This is the lowest layer of easelcomm. It provides:
//! - the [`Transport`] capability every link driver implements
//! - [`HardwareBuffer`], the descriptor for memory that travels as a DMA payload
//! - well-known [`ServiceId`]s used to open a session on the link
//! - the Unix domain socket stream used by the bundled link emulation
//!
//! Everything else builds on the types defined here.

pub mod buffer;
pub mod error;
pub mod service;
pub mod traits;
pub mod uds;

pub use buffer::{HardwareBuffer, PayloadDescriptor, SharedAllocator, SharedHandle};
pub use error::{Result, TransportError};
pub use service::ServiceId;
pub use traits::{InboundMessage, IpcStream, Role, Transport, WireMessage};
pub use uds::UnixDomainSocket;
