use easelcomm_link::LinkConfig;

/// Name given to the receive thread unless configured otherwise.
pub const DEFAULT_RECEIVE_THREAD_NAME: &str = "easelcomm-receive";

/// Configuration for a [`Comm`](crate::Comm) endpoint.
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// Link used by [`Comm::new`](crate::Comm::new).
    pub link: LinkConfig,
    pub receive_thread_name: String,
}

impl CommConfig {
    pub fn with_link(link: LinkConfig) -> Self {
        Self {
            link,
            ..Self::default()
        }
    }
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            receive_thread_name: DEFAULT_RECEIVE_THREAD_NAME.to_string(),
        }
    }
}
