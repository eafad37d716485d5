//! Link driver for easelcomm.
//!
//! [`UnixLink`] implements the [`Transport`](easelcomm_transport::Transport)
//! capability over a Unix domain socket, one socket per service id. It plays
//! either end of the link ([`Role::Client`](easelcomm_transport::Role) connects,
//! [`Role::Server`](easelcomm_transport::Role) listens) and emulates the DMA
//! engine: announced payloads are staged by the driver until the receiver
//! pulls or discards them, and the sender stays blocked until it has.

pub mod config;
pub mod handshake;
pub mod link;

pub use config::{HandshakeConfig, LinkConfig, DEFAULT_CONNECT_RETRY_INTERVAL};
pub use handshake::{handshake_client, handshake_server, Hello};
pub use link::UnixLink;
