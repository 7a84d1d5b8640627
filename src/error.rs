use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of a failed analysis attempt
///
/// Every lower-level failure is mapped onto exactly one of these kinds at the
/// analysis boundary. Retry decisions and fallback notifications only ever
/// look at the kind, never at the original error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The reasoning call exceeded its deadline
    Timeout,
    /// The reasoning capability refused the call for quota or rate reasons
    RateLimited,
    /// Credentials were missing or rejected
    Unauthorized,
    /// The reasoning capability answered with something unparseable
    Malformed,
    /// Connection-level failure or upstream server error
    NetworkFailure,
    /// Anything not covered above
    Unknown,
}

impl ErrorKind {
    /// Whether the condition may resolve on its own
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::RateLimited | ErrorKind::NetworkFailure
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Malformed => "malformed",
            ErrorKind::NetworkFailure => "network_failure",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during AI analysis
#[derive(Error, Debug, Clone)]
pub enum AnalysisError {
    #[error("Request timeout")]
    Timeout,

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Backend communication failed: {0}")]
    BackendError(String),
}

impl AnalysisError {
    /// Map this error onto the retry taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::Timeout => ErrorKind::Timeout,
            AnalysisError::RateLimited(_) => ErrorKind::RateLimited,
            AnalysisError::Unauthorized(_) => ErrorKind::Unauthorized,
            AnalysisError::InvalidResponse(_) => ErrorKind::Malformed,
            AnalysisError::Network(_) => ErrorKind::NetworkFailure,
            AnalysisError::BackendError(_) => ErrorKind::Unknown,
        }
    }

    /// Classify a non-success HTTP status returned by the inference server
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = format!("status {}: {}", status, body);
        match status {
            401 | 403 => AnalysisError::Unauthorized(detail),
            429 => AnalysisError::RateLimited(detail),
            408 | 504 => AnalysisError::Timeout,
            500..=599 => AnalysisError::Network(detail),
            _ => AnalysisError::BackendError(detail),
        }
    }
}

impl From<reqwest::Error> for AnalysisError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AnalysisError::Timeout
        } else if e.is_decode() {
            AnalysisError::InvalidResponse(e.to_string())
        } else if e.is_connect() || e.is_request() {
            AnalysisError::Network(e.to_string())
        } else if let Some(status) = e.status() {
            AnalysisError::from_status(status.as_u16(), &e.to_string())
        } else {
            AnalysisError::BackendError(e.to_string())
        }
    }
}

/// Errors that can occur when delivering a notification
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("Notification API rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Failed to send notification: {0}")]
    Network(String),

    #[error("Notification delivery gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Errors raised by an event source adapter
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Event source disconnected: {0}")]
    Disconnected(String),

    #[error("Failed to decode record: {0}")]
    Decode(String),

    #[error("Failed to commit offset: {0}")]
    Commit(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors returned by analysis tools
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid tool input: {0}")]
    InvalidInput(String),

    #[error("Tool request failed: {0}")]
    RequestFailed(String),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_error_kinds() {
        assert_eq!(AnalysisError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            AnalysisError::RateLimited("slow down".to_string()).kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            AnalysisError::Unauthorized("bad key".to_string()).kind(),
            ErrorKind::Unauthorized
        );
        assert_eq!(
            AnalysisError::InvalidResponse("not json".to_string()).kind(),
            ErrorKind::Malformed
        );
        assert_eq!(
            AnalysisError::Network("refused".to_string()).kind(),
            ErrorKind::NetworkFailure
        );
        assert_eq!(
            AnalysisError::BackendError("???".to_string()).kind(),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(AnalysisError::from_status(401, "").kind(), ErrorKind::Unauthorized);
        assert_eq!(AnalysisError::from_status(403, "").kind(), ErrorKind::Unauthorized);
        assert_eq!(AnalysisError::from_status(429, "").kind(), ErrorKind::RateLimited);
        assert_eq!(AnalysisError::from_status(408, "").kind(), ErrorKind::Timeout);
        assert_eq!(AnalysisError::from_status(504, "").kind(), ErrorKind::Timeout);
        assert_eq!(AnalysisError::from_status(502, "").kind(), ErrorKind::NetworkFailure);
        assert_eq!(AnalysisError::from_status(400, "").kind(), ErrorKind::Unknown);
    }

    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::Timeout.is_transient());
        assert!(ErrorKind::RateLimited.is_transient());
        assert!(ErrorKind::NetworkFailure.is_transient());
        assert!(!ErrorKind::Unauthorized.is_transient());
        assert!(!ErrorKind::Malformed.is_transient());
        assert!(!ErrorKind::Unknown.is_transient());
    }

    #[test]
    fn test_error_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::RateLimited).unwrap(),
            "\"rate_limited\""
        );
        assert_eq!(ErrorKind::NetworkFailure.to_string(), "network_failure");
    }
}
