//! Error types for Duet Core

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error types
#[derive(Error, Debug)]
pub enum Error {
    // Index errors
    #[error("Failed to parse segment index: {0}")]
    IndexParse(String),

    #[error("Truncated data: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Invalid variable-length integer at offset {offset}")]
    InvalidVint { offset: usize },

    #[error("No segment contains time {time}s")]
    SegmentNotFound { time: f64 },

    // Sink errors
    #[error("Sink quota exceeded")]
    QuotaExceeded,

    #[error("Sink operation rejected: {0}")]
    SinkState(String),

    #[error("Codec not supported: {codec}")]
    UnsupportedCodec { codec: String },

    // Fetch errors
    #[error("Forbidden: {url}")]
    Forbidden { url: String },

    #[error("HTTP status {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Request timed out after {timeout_ms}ms: {url}")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("Giving up on {url} after {attempts} attempts")]
    RetriesExhausted { url: String, attempts: u32 },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if this error is recovered locally by retrying
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::QuotaExceeded
                | Error::Timeout { .. }
                | Error::Network(_)
                | Error::Truncated { .. }
        ) || matches!(self, Error::HttpStatus { status, .. } if is_retryable_status(*status))
    }

    /// Returns true if this error ends progress for the stream that hit it
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Forbidden { .. } | Error::RetriesExhausted { .. }
        ) || matches!(self, Error::HttpStatus { status, .. } if !is_retryable_status(*status))
    }

    /// Returns the error code for diagnostics
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::IndexParse(_) => "INDEX_PARSE",
            Error::Truncated { .. } => "TRUNCATED",
            Error::InvalidVint { .. } => "INVALID_VINT",
            Error::SegmentNotFound { .. } => "SEGMENT_NOT_FOUND",
            Error::QuotaExceeded => "QUOTA_EXCEEDED",
            Error::SinkState(_) => "SINK_STATE",
            Error::UnsupportedCodec { .. } => "CODEC_UNSUPPORTED",
            Error::Forbidden { .. } => "FORBIDDEN",
            Error::HttpStatus { .. } => "HTTP_STATUS",
            Error::Timeout { .. } => "TIMEOUT",
            Error::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            Error::Network(_) => "NETWORK",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Json(_) => "JSON",
            Error::Io(_) => "IO",
        }
    }
}

/// Server errors and throttling are worth another attempt; other statuses are final
pub(crate) fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}
