//! Error types for edge resolution and session negotiation

/// Result type alias using the player Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving an edge or negotiating a session
///
/// A full directory ("FULL") is not an error; it surfaces as
/// [`SourceResult::Absent`](crate::directory::SourceResult) or
/// [`ResolutionStatus::NoStream`](crate::directory::ResolutionStatus).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration or missing required input
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Network, DNS or TLS failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Non-2xx response from the WHEP endpoint
    #[error("Negotiation rejected: HTTP {status} {reason}")]
    NegotiationRejected {
        /// HTTP status code
        status: u16,
        /// Canonical reason phrase (may be empty)
        reason: String,
    },

    /// Connectivity to the edge was lost after the session was established
    #[error("Media connectivity lost: {0}")]
    MediaConnectivityLost(String),

    /// SDP offer/answer error
    #[error("SDP negotiation error: {0}")]
    Sdp(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Operation on a closed session or a stopped orchestrator
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is absorbed by a fresh resolution attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::NegotiationRejected { .. }
                | Error::MediaConnectivityLost(_)
                | Error::Sdp(_)
                | Error::WebRtc(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// HTTP status carried by a rejected negotiation
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::NegotiationRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("stream name is empty".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: stream name is empty");

        let err = Error::NegotiationRejected {
            status: 503,
            reason: "Service Unavailable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Negotiation rejected: HTTP 503 Service Unavailable"
        );
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::Transport("dns".to_string()).is_retryable());
        assert!(Error::MediaConnectivityLost("failed".to_string()).is_retryable());
        assert!(Error::NegotiationRejected {
            status: 404,
            reason: String::new()
        }
        .is_retryable());
        assert!(!Error::InvalidConfig("test".to_string()).is_retryable());
        assert!(!Error::SessionClosed("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_is_config_error() {
        assert!(Error::InvalidConfig("test".to_string()).is_config_error());
        assert!(!Error::Transport("test".to_string()).is_config_error());
    }

    #[test]
    fn test_http_status() {
        let err = Error::NegotiationRejected {
            status: 503,
            reason: String::new(),
        };
        assert_eq!(err.http_status(), Some(503));
        assert_eq!(Error::Transport("x".to_string()).http_status(), None);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
    }
}
