//! Error types for proxy operations.
//!
//! Failures carry upstream context where available and map onto HTTP
//! statuses reported to the client (502 unless noted otherwise). Each error
//! may additionally expose a short symbolic code; the engine classifies
//! codes into mute/warn/error via the configured code sets.

use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations, relaying).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Invalid CONNECT request (missing or malformed authority).
    #[error("invalid CONNECT request: {0}")]
    InvalidConnect(String),

    /// Malformed non-CONNECT proxy request (e.g. origin-form target).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A route pattern failed to compile at insertion.
    #[error("invalid route pattern '{pattern}': {message}")]
    InvalidRoute {
        /// The offending pattern.
        pattern: String,
        /// Regex compile error text.
        message: String,
    },

    /// TLS error during handshake or context construction.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate authority or store failure.
    #[error("certificate error: {0}")]
    Cert(#[from] crate::certs::CertError),

    /// The upstream proxy answered CONNECT with a non-200 status.
    #[error("upstream proxy '{upstream}' refused CONNECT with status {status}")]
    ProxyConnectionFailed {
        /// Upstream `host:port` the CONNECT was sent to.
        upstream: String,
        /// Status returned by the upstream.
        status: u16,
    },

    /// An outbound connect attempt exceeded the configured timeout.
    #[error("outbound connect timed out (upstream: {upstream:?})")]
    ProxyConnectionTimeout {
        /// Upstream `host:port`, if the attempt went through one.
        upstream: Option<String>,
    },

    /// The bumped outbound TLS session did not verify against the
    /// configured roots.
    #[error("remote TLS session for '{host}' was not authorized")]
    RemoteConnectionNotAuthorized {
        /// Target hostname of the failed session.
        host: String,
    },

    /// The authenticate hook rejected the request.
    #[error("{message}")]
    Denied {
        /// HTTP status to surface to the client.
        status: u16,
        /// Human-readable rejection reason.
        message: String,
    },

    /// HTTP-level forwarding failed before a response began.
    #[error("forwarding failed: {0}")]
    Forward(String),

    /// Server shutdown requested.
    #[error("server shutdown")]
    Shutdown,
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// How an error should be surfaced by the engine's logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Silently discarded (benign peer-initiated closes).
    Mute,
    /// Logged at warn level.
    Warn,
    /// Logged at error level.
    Error,
}

impl ProxyError {
    /// The HTTP status reported to the client for this error.
    ///
    /// Defaults to 502; an upstream CONNECT refusal carries the upstream's
    /// own status, authenticate rejections carry the hook's status, and
    /// HTTP-level forwarding failures map to 599.
    pub fn status(&self) -> u16 {
        match self {
            ProxyError::ProxyConnectionFailed { status, .. } => *status,
            ProxyError::Denied { status, .. } => *status,
            ProxyError::InvalidConnect(_) | ProxyError::BadRequest(_) => 400,
            ProxyError::InvalidRoute { .. } => 400,
            ProxyError::Forward(_) => 599,
            _ => 502,
        }
    }

    /// The symbolic code used for mute/warn classification, if any.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            ProxyError::Io(e) => io_error_code(e),
            ProxyError::Http(e) => {
                if e.is_incomplete_message() {
                    Some("ERR_STREAM_PREMATURE_CLOSE")
                } else if e.is_canceled() {
                    Some("ERR_STREAM_DESTROYED")
                } else {
                    None
                }
            }
            ProxyError::ProxyConnectionTimeout { .. } => Some("ETIMEDOUT"),
            _ => None,
        }
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

/// Map an I/O error onto the symbolic code space used by the
/// mute/warn/error classification.
fn io_error_code(err: &std::io::Error) -> Option<&'static str> {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::BrokenPipe => Some("EPIPE"),
        ErrorKind::ConnectionReset => Some("ECONNRESET"),
        ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
        ErrorKind::NotConnected => Some("ENOTCONN"),
        ErrorKind::InvalidInput => Some("EINVAL"),
        ErrorKind::TimedOut => Some("ETIMEDOUT"),
        ErrorKind::UnexpectedEof => Some("ERR_STREAM_PREMATURE_CLOSE"),
        ErrorKind::WriteZero => Some("ERR_STREAM_WRITE_AFTER_END"),
        ErrorKind::AddrInUse => Some("EADDRINUSE"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_default_status_is_502() {
        let err = ProxyError::Tls("handshake failed".into());
        assert_eq!(err.status(), 502);

        let err = ProxyError::ProxyConnectionTimeout { upstream: None };
        assert_eq!(err.status(), 502);
    }

    #[test]
    fn test_upstream_refusal_carries_status() {
        let err = ProxyError::ProxyConnectionFailed {
            upstream: "proxy.local:3128".into(),
            status: 407,
        };
        assert_eq!(err.status(), 407);
        assert!(err.to_string().contains("proxy.local:3128"));
        assert!(err.to_string().contains("407"));
    }

    #[test]
    fn test_denied_carries_hook_status() {
        let err = ProxyError::Denied {
            status: 403,
            message: "credentials rejected".into(),
        };
        assert_eq!(err.status(), 403);
    }

    #[test]
    fn test_forward_failure_maps_to_599() {
        let err = ProxyError::Forward("origin unreachable".into());
        assert_eq!(err.status(), 599);
    }

    #[test]
    fn test_io_codes() {
        let pipe = ProxyError::Io(std::io::Error::new(ErrorKind::BrokenPipe, "pipe"));
        assert_eq!(pipe.code(), Some("EPIPE"));

        let eof = ProxyError::Io(std::io::Error::new(ErrorKind::UnexpectedEof, "eof"));
        assert_eq!(eof.code(), Some("ERR_STREAM_PREMATURE_CLOSE"));

        let refused = ProxyError::Io(std::io::Error::new(ErrorKind::ConnectionRefused, "no"));
        assert_eq!(refused.code(), None);
    }

    #[test]
    fn test_timeout_has_code() {
        let err = ProxyError::ProxyConnectionTimeout {
            upstream: Some("proxy.local:3128".into()),
        };
        assert_eq!(err.code(), Some("ETIMEDOUT"));
    }
}
