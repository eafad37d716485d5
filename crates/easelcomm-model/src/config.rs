use easelcomm_frame::ChannelId;

/// Default name of the request worker thread.
pub const DEFAULT_WORKER_THREAD_NAME: &str = "easelcomm-model-worker";

/// Channels and thread naming shared by [`ModelServer`](crate::ModelServer)
/// and [`ModelClient`](crate::ModelClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelServerConfig {
    /// Client → server: command records and pool buffers.
    pub command_channel: ChannelId,
    /// Server → client: acknowledgements, outputs and completions.
    pub response_channel: ChannelId,
    pub worker_thread_name: String,
}

impl Default for ModelServerConfig {
    fn default() -> Self {
        Self {
            command_channel: 1,
            response_channel: 2,
            worker_thread_name: DEFAULT_WORKER_THREAD_NAME.to_string(),
        }
    }
}
