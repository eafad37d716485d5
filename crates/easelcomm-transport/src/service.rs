//! Well-known service ids.
//!
//! A service id names the session opened on the link. Both sides compile in
//! the same constants; ids are never negotiated. Ids 0-15 are reserved for
//! the built-in services below, 16 and up are free for applications.

use std::fmt;

/// Identifies one service session on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub u32);

impl ServiceId {
    /// System control (power, clocks, boot handshakes).
    pub const SYSTEM_CONTROL: ServiceId = ServiceId(0);
    /// Remote shell.
    pub const SHELL: ServiceId = ServiceId(1);
    /// Loopback and self-test traffic.
    pub const TEST: ServiceId = ServiceId(2);
    /// Image processing requests.
    pub const IMAGE_PROCESSING: ServiceId = ServiceId(3);
    /// Model execution requests.
    pub const MODEL_EXECUTION: ServiceId = ServiceId(4);
    /// Coprocessor log forwarding.
    pub const LOGGING: ServiceId = ServiceId(5);

    /// First application-defined service id.
    pub const USER_START: u32 = 16;

    /// Raw integer value, as used on the wire and in socket names.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Human-readable name of the service.
    pub fn name(self) -> &'static str {
        match self {
            ServiceId::SYSTEM_CONTROL => "SYSTEM_CONTROL",
            ServiceId::SHELL => "SHELL",
            ServiceId::TEST => "TEST",
            ServiceId::IMAGE_PROCESSING => "IMAGE_PROCESSING",
            ServiceId::MODEL_EXECUTION => "MODEL_EXECUTION",
            ServiceId::LOGGING => "LOGGING",
            ServiceId(6..=15) => "RESERVED",
            _ => "USER",
        }
    }

    /// Returns true if the id is in the reserved range.
    pub fn is_reserved(self) -> bool {
        self.0 < Self::USER_START
    }
}

impl From<u32> for ServiceId {
    fn from(value: u32) -> Self {
        ServiceId(value)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}
