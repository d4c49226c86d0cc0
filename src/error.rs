use thiserror::Error;

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct ServiceError {
    stage: &'static str,
    message: String,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    Unauthorized,
    NotFound,
    Conflict,
    InsufficientCredits,
    Upstream,
    UpstreamTimeout,
    Internal,
}

impl ErrorKind {
    /// Stable machine-readable code rendered in the `error` field of responses.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "request_in_progress",
            ErrorKind::InsufficientCredits => "insufficient_credits",
            ErrorKind::Upstream => "upstream_error",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::Internal => "internal_error",
        }
    }
}

impl ServiceError {
    fn new(stage: &'static str, message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, ErrorKind::InvalidInput)
    }

    pub fn unauthorized(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, ErrorKind::Unauthorized)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, ErrorKind::NotFound)
    }

    pub fn conflict(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, ErrorKind::Conflict)
    }

    pub fn insufficient_credits(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, ErrorKind::InsufficientCredits)
    }

    pub fn upstream(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, ErrorKind::Upstream)
    }

    pub fn upstream_timeout(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, ErrorKind::UpstreamTimeout)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, ErrorKind::Internal)
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}
