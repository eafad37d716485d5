//! Message and DMA payload exchange between an application processor and
//! its coprocessor.
//!
//! # Crate Structure
//!
//! - [`transport`]: the link capability, hardware buffers and service ids
//! - [`frame`]: link frames and the channel-addressed [`frame::Message`]
//! - [`link`]: the Unix-socket link driver used by both roles
//! - [`comm`]: the [`comm::Comm`] endpoint, receive loop and blocking RPC
//! - [`model`]: multi-part model/request streaming (behind `model` feature)

/// Re-export transport types.
pub mod transport {
    pub use easelcomm_transport::*;
}

/// Re-export frame and message types.
pub mod frame {
    pub use easelcomm_frame::*;
}

/// Re-export the link driver.
pub mod link {
    pub use easelcomm_link::*;
}

/// Re-export endpoint types.
pub mod comm {
    pub use easelcomm_comm::*;
}

/// Re-export the model protocol (requires `model` feature).
#[cfg(feature = "model")]
pub mod model {
    pub use easelcomm_model::*;
}
