use bytes::Bytes;
use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Classification of URL validation failures.
///
/// Provides programmatic matching for different failure modes without
/// relying on unstable error message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// URL could not be parsed (malformed syntax)
    ParseError,
    /// URL is missing required host/authority component
    MissingAuthority,
}

/// HTTP client error types
///
/// Variants are grouped by the stage that produced them. Errors raised before
/// the transport is called (`UnsupportedMethod`, `JsonEncoding`, ...) guarantee
/// that nothing was sent. `BadResponse` and `JsonDecoding` keep the raw response
/// bytes so callers can inspect what the server returned.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Method is not in the accepted set for the client's validation mode
    #[error("Unsupported method '{0}'")]
    UnsupportedMethod(String),

    /// URL scheme other than `http` or `https`
    #[error("Unsupported protocol <{scheme}>, expect [http,https]")]
    UnsupportedProtocol {
        /// The scheme that was rejected
        scheme: String,
    },

    /// Invalid URL (failed to parse)
    ///
    /// Use the `kind` field for programmatic matching. The `reason` field contains
    /// a diagnostic message intended for logging only.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        /// The URL that failed to parse
        url: String,
        /// Structured failure classification for programmatic matching
        kind: InvalidUriKind,
        /// Diagnostic message (unstable format, for logging only)
        reason: String,
    },

    /// Rejected configuration value (zero timeout, empty header key, ...)
    #[error("Invalid configuration for {setting}: {reason}")]
    InvalidConfiguration {
        /// Name of the rejected setting
        setting: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// Request body could not be serialized; nothing was sent
    #[error("Failed to perform json serialization on {value_type}: {source}")]
    JsonEncoding {
        /// Type name of the value that failed to serialize
        value_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Whole-request deadline exceeded
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Server did not send response headers in time
    #[error("Response headers not received within {0:?}")]
    ResponseHeaderTimeout(Duration),

    /// Transport error (DNS, connection, proxy tunnel, etc)
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Response head arrived but the body stream failed part way
    #[error("Failed to read response body after status {status}: {source}")]
    BodyRead {
        /// Response status code
        status: StatusCode,
        /// Bytes received before the failure
        partial: Bytes,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Request reached the server but the status is outside `[200, 300)`
    #[error(
        "Bad response from request method: {method}, path: {path}, body: {}: {status_text}",
        .body.as_deref().unwrap_or("<none>")
    )]
    BadResponse {
        /// Request method
        method: http::Method,
        /// Path (or full target) the caller asked for
        path: String,
        /// JSON text of the request body, if any
        body: Option<String>,
        /// Canonical reason phrase for the status
        status_text: String,
        /// Response status code
        status: StatusCode,
        /// Response body as read before classification
        response_body: Bytes,
    },

    /// Response body could not be deserialized into the requested type
    #[error(
        "Failed to perform json deserialization on {} to {target}: {source}",
        String::from_utf8_lossy(.raw)
    )]
    JsonDecoding {
        /// Raw response bytes
        raw: Bytes,
        /// Type name of the requested target
        target: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl HttpError {
    /// Status code of the response, when one was received.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::BadResponse { status, .. } | HttpError::BodyRead { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Raw response bytes, when they were read before the failure.
    #[must_use]
    pub fn response_body(&self) -> Option<&Bytes> {
        match self {
            HttpError::BadResponse { response_body, .. } => Some(response_body),
            HttpError::JsonDecoding { raw, .. } => Some(raw),
            HttpError::BodyRead { partial, .. } => Some(partial),
            _ => None,
        }
    }

    /// True for failures below HTTP: connect, TLS, proxy tunnel, timeouts and
    /// a body stream cut off after the status arrived.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            HttpError::Transport(_)
                | HttpError::Tls(_)
                | HttpError::Timeout(_)
                | HttpError::ResponseHeaderTimeout(_)
                | HttpError::BodyRead { .. }
        )
    }
}

impl From<hyper::Error> for HttpError {
    fn from(err: hyper::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for HttpError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}
