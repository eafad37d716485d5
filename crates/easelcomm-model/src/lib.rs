//! Multi-part model execution protocol.
//!
//! A client ships a model as one metadata record followed by N buffer pools,
//! then submits requests the same way. The server assembles each object on
//! the receive thread and hands completed requests to a worker thread, so
//! acknowledgements are never held up by execution.

pub mod assembly;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod server;

pub use assembly::{Assembly, Progress};
pub use client::{CompletedRequest, ModelClient};
pub use config::{ModelServerConfig, DEFAULT_WORKER_THREAD_NAME};
pub use error::{ModelError, Result};
pub use executor::{ExecutionError, Executor, Model, Request};
pub use protocol::{Command, Response, STATUS_OK};
pub use server::{ModelServer, ServerState};
