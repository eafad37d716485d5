use std::path::{Path, PathBuf};
use std::time::Duration;

use easelcomm_frame::FrameConfig;
use easelcomm_transport::ServiceId;

/// Default pause between connection attempts while the server is not up yet.
pub const DEFAULT_CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for the link handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Timeout for each blocking handshake operation.
    pub timeout: Duration,
    /// Expected protocol name.
    pub protocol_name: String,
    /// Local protocol version, `<major>.<minor>`.
    pub protocol_version: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: "easelcomm".to_string(),
            protocol_version: "1.0".to_string(),
        }
    }
}

/// Configuration for a [`UnixLink`](crate::UnixLink).
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Directory holding one socket per service.
    pub socket_dir: PathBuf,
    /// Frame limits and stream timeouts once the link is up.
    pub frame: FrameConfig,
    /// Pause between connection attempts (client role).
    pub connect_retry_interval: Duration,
    pub handshake: HandshakeConfig,
}

impl LinkConfig {
    /// Default configuration rooted at `socket_dir`.
    pub fn with_socket_dir(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            ..Self::default()
        }
    }

    /// Socket path for `service`: `<socket_dir>/service-<id>.sock`.
    pub fn socket_path(&self, service: ServiceId) -> PathBuf {
        service_socket_path(&self.socket_dir, service)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            socket_dir: std::env::temp_dir().join("easelcomm"),
            frame: FrameConfig::default(),
            connect_retry_interval: DEFAULT_CONNECT_RETRY_INTERVAL,
            handshake: HandshakeConfig::default(),
        }
    }
}

fn service_socket_path(dir: &Path, service: ServiceId) -> PathBuf {
    dir.join(format!("service-{}.sock", service.as_u32()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_per_service() {
        let config = LinkConfig::with_socket_dir("/run/easel");
        assert_eq!(
            config.socket_path(ServiceId::TEST),
            PathBuf::from("/run/easel/service-2.sock")
        );
        assert_eq!(
            config.socket_path(ServiceId(42)),
            PathBuf::from("/run/easel/service-42.sock")
        );
    }

    #[test]
    fn defaults() {
        let config = LinkConfig::default();
        assert!(config.socket_dir.ends_with("easelcomm"));
        assert_eq!(config.connect_retry_interval, Duration::from_millis(10));
        assert_eq!(config.handshake.protocol_name, "easelcomm");
        assert_eq!(config.handshake.protocol_version, "1.0");
        assert!(config.frame.read_timeout.is_none());
    }
}
