//! Error types for pitchlab-core

use thiserror::Error;

/// Main error type for the pitchlab-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Missing or malformed caller input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Session not found
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Session exists but carries no usable transcript
    #[error("transcript empty for session: {0}")]
    TranscriptEmpty(String),

    /// LLM backend unreachable or persistently failing after retries
    #[error("grading unavailable: {0}")]
    GradingUnavailable(String),

    /// LLM response could not be parsed, repaired, or partially extracted
    #[error("LLM response unusable: {0}")]
    LlmShape(String),

    /// Persistence target lacks an expected column
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Webhook signature verification failed
    #[error("webhook signature invalid: {0}")]
    SignatureInvalid(String),

    /// Operation exceeded its overall time budget
    #[error("timed out: {0}")]
    Timeout(String),
}

/// Machine-readable error category for the owning application's HTTP routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller supplied bad or missing input (400)
    Input,
    /// Session or transcript does not exist (404)
    NotFound,
    /// Signature or auth failure (401)
    Unauthorized,
    /// Upstream dependency temporarily unavailable (503)
    Unavailable,
    /// Everything else (500)
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Input => "input",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Unauthorized => "unauthorized",
            ErrorCategory::Unavailable => "unavailable",
            ErrorCategory::Internal => "internal",
        }
    }

    /// HTTP status code the owning application should respond with.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCategory::Input => 400,
            ErrorCategory::NotFound => 404,
            ErrorCategory::Unauthorized => 401,
            ErrorCategory::Unavailable => 503,
            ErrorCategory::Internal => 500,
        }
    }
}

impl Error {
    /// Classify this error for the HTTP boundary.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidInput(_) => ErrorCategory::Input,
            Error::SessionNotFound(_) | Error::TranscriptEmpty(_) => ErrorCategory::NotFound,
            Error::SignatureInvalid(_) => ErrorCategory::Unauthorized,
            Error::GradingUnavailable(_) | Error::Timeout(_) => ErrorCategory::Unavailable,
            _ => ErrorCategory::Internal,
        }
    }
}

/// Result type alias for pitchlab-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_maps_to_http_status() {
        assert_eq!(
            Error::InvalidInput("x".into()).category().http_status(),
            400
        );
        assert_eq!(
            Error::SessionNotFound("s".into()).category().http_status(),
            404
        );
        assert_eq!(
            Error::GradingUnavailable("llm".into())
                .category()
                .http_status(),
            503
        );
        assert_eq!(
            Error::SignatureInvalid("bad".into())
                .category()
                .http_status(),
            401
        );
        assert_eq!(Error::Config("c".into()).category().http_status(), 500);
    }
}
