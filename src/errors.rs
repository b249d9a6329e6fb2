use crate::config::FetchConfigError;

/// Errors raised by the fetch engine.
///
/// The variants mirror the failure classes a Fetch caller can observe:
/// synchronous validation failures (`Type`, `Range`), cancellation (`Aborted`),
/// a fetch that produced no usable response (`Network`), and failures surfacing
/// through a body stream after the response was delivered (`Stream`).
///
/// The type is `Clone` because a single transport failure is delivered to both
/// the pending fetch and the response body stream.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("TypeError: {0}")]
    Type(String),

    #[error("RangeError: {0}")]
    Range(String),

    #[error("AbortError: the operation was aborted")]
    Aborted,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] FetchConfigError),
}

impl FetchError {
    pub(crate) fn type_error(msg: impl Into<String>) -> Self {
        FetchError::Type(msg.into())
    }

    pub(crate) fn range_error(msg: impl Into<String>) -> Self {
        FetchError::Range(msg.into())
    }

    /// Returns true when the error was caused by cancellation
    pub fn is_abort(&self) -> bool {
        matches!(self, FetchError::Aborted)
    }

    pub fn is_type_error(&self) -> bool {
        matches!(self, FetchError::Type(_))
    }

    pub fn is_network(&self) -> bool {
        matches!(self, FetchError::Network(_))
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Json(err.to_string())
    }
}

impl From<url::ParseError> for FetchError {
    fn from(err: url::ParseError) -> Self {
        FetchError::Type(format!("invalid URL: {err}"))
    }
}

impl From<http::header::InvalidHeaderName> for FetchError {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        FetchError::Type(format!("invalid header name: {err}"))
    }
}

impl From<http::header::InvalidHeaderValue> for FetchError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        FetchError::Type(format!("invalid header value: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
