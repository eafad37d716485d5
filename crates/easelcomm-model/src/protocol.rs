use serde::{Deserialize, Serialize};

/// Completion status reported for a request that executed cleanly.
pub const STATUS_OK: &str = "ok";

/// Client → server records on the command channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Metadata for a model; `pool_sizes.len()` pool buffers follow.
    LoadModel { name: String, pool_sizes: Vec<usize> },
    /// Metadata for a request; `input_sizes.len()` input buffers follow.
    SubmitRequest {
        request_id: u64,
        input_sizes: Vec<usize>,
        output_sizes: Vec<usize>,
    },
    Destroy,
}

/// Server → client records on the response channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum Response {
    ModelLoaded,
    RequestAccepted { request_id: u64 },
    /// `sizes.len()` output buffers follow, ids ascending from 0.
    Outputs { request_id: u64, sizes: Vec<usize> },
    RequestComplete { request_id: u64, status: String },
    Destroyed,
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ModelLoaded => "model_loaded",
            Self::RequestAccepted { .. } => "request_accepted",
            Self::Outputs { .. } => "outputs",
            Self::RequestComplete { .. } => "request_complete",
            Self::Destroyed => "destroyed",
        }
    }
}
