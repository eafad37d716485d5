//! Channel-multiplexed endpoint for easelcomm.
//!
//! A [`Comm`] owns one link session, a channel → handler table and the single
//! receive thread that dispatches inbound messages to those handlers, one at
//! a time and in arrival order. [`rpc`] builds blocking request/response
//! calls on top of it.

pub mod comm;
pub mod config;
pub mod error;
pub mod rpc;

pub use comm::{Comm, ConnectionState, Handler};
pub use config::{CommConfig, DEFAULT_RECEIVE_THREAD_NAME};
pub use error::{CommError, Result};
pub use rpc::RpcClient;
