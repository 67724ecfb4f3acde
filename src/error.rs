use thiserror::Error;

/// Error surface shared by the river consumer, reconciliation engine and
/// aggregator. Network, decode and store errors are fatal to the loop that
/// hits them; the durable cursor in the changesets table makes a process
/// restart the recovery path.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("network request failed: {0}")]
    Network(String),

    #[error("unexpected status {status} from {endpoint}")]
    BadStatus {
        endpoint: &'static str,
        status: reqwest::StatusCode,
    },

    #[error("upstream rate limit exceeded, retry after {0}ms")]
    RateLimited(u64),

    #[error("failed to decode upstream payload: {0}")]
    Decode(String),

    #[error("store operation failed: {0}")]
    Store(#[from] sqlx::Error),

    #[error("change id shape mismatch between {head} and {current}")]
    CursorShapeMismatch { head: String, current: String },

    #[error("reconcile invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        PipelineError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Decode(e.to_string())
    }
}
