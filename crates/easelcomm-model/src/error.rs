use easelcomm_comm::CommError;

/// Errors observed by a [`ModelClient`](crate::ModelClient).
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Endpoint error.
    #[error("comm error: {0}")]
    Comm(#[from] CommError),

    /// The server answered with something other than what the operation
    /// waits for.
    #[error("expected {expected}, server sent {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: String,
    },

    /// The executor reported a failure for a request.
    #[error("request {request_id} failed: {status}")]
    ExecutionFailed { request_id: u64, status: String },

    /// The response handler went away while an operation was waiting.
    #[error("response stream closed")]
    ResponsesClosed,
}

pub type Result<T> = std::result::Result<T, ModelError>;
