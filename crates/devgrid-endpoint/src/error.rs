use std::time::Duration;

/// Errors raised when creating or addressing endpoints.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint name already taken: {0}")]
    NameTaken(String),

    #[error("invalid endpoint name: {0}")]
    InvalidName(String),

    #[error("endpoint stopped: {0}")]
    Stopped(String),
}

/// Failure of a request-reply exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AskError {
    /// No reply arrived before the deadline. Also reported when the target
    /// does not resolve or drops the request without answering.
    #[error("ask to {path} timed out after {after:?}")]
    Timeout { path: String, after: Duration },
}

pub type EndpointResult<T> = Result<T, EndpointError>;
