//! Error types
//!
//! Backend failures are split the way the workflow needs to react to them:
//! transport problems, application-level `code != 0` answers, validation
//! failures that carry a list of messages, and cancellation.

/// Failure of a single backend request
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// Network or HTTP-layer failure, empty body, or a body that is not a valid envelope
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered with `code != 0`
    #[error("backend error [{code}]: {message}")]
    Application { code: i64, message: String },

    /// The backend rejected the request with a list of validation messages
    #[error("validation failed: {message} ({})", errors.join("; "))]
    ValidationFailure { message: String, errors: Vec<String> },

    /// The run was aborted while the request was in flight
    #[error("request cancelled")]
    Cancelled,
}

impl BackendError {
    pub fn transport(msg: impl Into<String>) -> Self {
        BackendError::Transport(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackendError::Cancelled)
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        BackendError::Transport(e.to_string())
    }
}

/// Rejected aggregator input
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReportError {
    #[error("invalid report input: {0}")]
    InvalidInput(String),
}

/// Errors returned by the workflow engine itself, never by a stage
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("workflow already running")]
    Busy,
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;
