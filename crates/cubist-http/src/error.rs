//! HTTP error types and handling

use cubist_common::{HttpMethod, HttpStatus};
use std::fmt;
use thiserror::Error;

/// HTTP-specific errors
#[derive(Error, Debug)]
pub enum HttpError {
    /// Connection failed (DNS, TCP, TLS)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Request timeout
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Invalid request configuration
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The server answered with a non-success status
    #[error("{method} {path} returned {status}: {body}")]
    Status {
        status: HttpStatus,
        method: HttpMethod,
        path: String,
        body: String,
    },

    /// Response parsing error
    #[error("Response error: {0}")]
    ResponseError(String),

    /// URL parsing error
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Generic reqwest error
    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Result type for HTTP operations
pub type HttpResult<T> = Result<T, HttpError>;

/// Error category for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorCategory {
    /// Connection-related errors (DNS, TCP, TLS)
    Connection,
    /// Timeout errors
    Timeout,
    /// Invalid request construction
    Request,
    /// Response parsing or status errors
    Response,
    /// Unknown/other errors
    Unknown,
}

impl HttpErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::Request => "request",
            Self::Response => "response",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HttpErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl HttpError {
    /// Categorize the error for reporting
    pub fn category(&self) -> HttpErrorCategory {
        match self {
            HttpError::Connection(_) => HttpErrorCategory::Connection,
            HttpError::Timeout(_) => HttpErrorCategory::Timeout,
            HttpError::InvalidRequest(_) | HttpError::InvalidUrl(_) => HttpErrorCategory::Request,
            HttpError::Status { .. } | HttpError::ResponseError(_) | HttpError::Json(_) => {
                HttpErrorCategory::Response
            }
            HttpError::Reqwest(e) => {
                if e.is_connect() {
                    HttpErrorCategory::Connection
                } else if e.is_timeout() {
                    HttpErrorCategory::Timeout
                } else if e.is_request() {
                    HttpErrorCategory::Request
                } else {
                    HttpErrorCategory::Unknown
                }
            }
            HttpError::UrlParse(_) => HttpErrorCategory::Request,
        }
    }

    /// Status code if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(status.code()),
            HttpError::Reqwest(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// True for a 404 answer
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Sanitize error message (remove sensitive info like credentials, internal IPs)
    pub fn sanitized_message(&self) -> String {
        let msg = self.to_string();
        sanitize_error_message(&msg)
    }
}

/// Sanitize error messages by removing sensitive information
fn sanitize_error_message(msg: &str) -> String {
    use regex::Regex;
    use std::sync::OnceLock;

    static URL_CREDS_RE: OnceLock<Regex> = OnceLock::new();
    static INTERNAL_IP_RE: OnceLock<Regex> = OnceLock::new();
    static AUTH_HEADER_RE: OnceLock<Regex> = OnceLock::new();

    let url_creds_re = URL_CREDS_RE
        .get_or_init(|| Regex::new(r"https?://[^@:/]+:[^@]+@").expect("valid regex"));
    let internal_ip_re = INTERNAL_IP_RE.get_or_init(|| {
        Regex::new(r"\b(10\.|172\.(1[6-9]|2[0-9]|3[01])\.|192\.168\.)\d+\.\d+\b")
            .expect("valid regex")
    });
    let auth_header_re = AUTH_HEADER_RE.get_or_init(|| {
        Regex::new(r"(?i)(authorization:\s*basic|authorization:\s*bearer|bearer|basic|camnamespace|password)\s*[:=]?\s*\S+")
            .expect("valid regex")
    });

    let sanitized = url_creds_re.replace_all(msg, "https://[REDACTED]@");
    let sanitized = internal_ip_re.replace_all(&sanitized, "[INTERNAL_IP]");
    let sanitized = auth_header_re.replace_all(&sanitized, "$1: [REDACTED]");

    sanitized.to_string()
}
