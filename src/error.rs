//! Error types for rsmsl.

use thiserror::Error;

/// Main error type for rsmsl operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Required identity cookies are missing, malformed, or were rejected.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The key exchange failed (network, service error, or malformed response).
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// An inbound message failed signature verification or could not be opened.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// An inbound message did not advance the session sequence.
    #[error("Replayed message: sequence {received:?} does not advance past {last:?}")]
    Replay {
        last: (u64, u64),
        received: (u64, u64),
    },

    /// The service no longer accepts the session's master token.
    #[error("Session rejected by service: {0}")]
    SessionRejected(String),

    /// The manifest body could not be interpreted.
    #[error("Manifest parse error: {0}")]
    ManifestParse(#[from] crate::manifest::ManifestParseError),

    /// Reading or writing the key cache failed.
    #[error("Key cache I/O error: {0}")]
    CacheIo(String),

    /// The manifest request is missing something the service needs.
    #[error("Invalid manifest request: {0}")]
    InvalidRequest(String),

    /// The service answered with an application-level error.
    #[error("Service error: {0}")]
    Service(String),

    /// The request could not be delivered or the response could not be read.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// RSA error.
    #[error("RSA error: {0}")]
    RsaError(#[from] rsa::Error),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Whether an orchestrating caller may retry the failed call as-is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Handshake(_) | Error::Transport(_))
    }

    /// Whether the cached session must be discarded before further traffic.
    #[must_use]
    pub fn forces_renegotiation(&self) -> bool {
        matches!(self, Error::Integrity(_) | Error::Replay { .. } | Error::SessionRejected(_))
    }

    /// A short, actionable message for end users.
    ///
    /// Authentication and handshake failures are kept distinct from each
    /// other and from "no matching formats", which is not an error at all.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Error::Authentication(_) => {
                "Your session cookies are missing or expired. Export fresh cookies while signed in and try again."
            }
            Error::Handshake(_) | Error::Transport(_) => {
                "Could not establish a secure session with the catalog service. Try again shortly."
            }
            Error::Integrity(_) | Error::Replay { .. } => {
                "The catalog service response could not be verified. Try again."
            }
            Error::InvalidRequest(_) | Error::Config(_) => {
                "The request is misconfigured. Check the profile and device settings."
            }
            Error::SessionRejected(_) => "The secure session with the catalog service expired. Try again.",
            Error::Service(_) => "The catalog service refused the request for this title.",
            _ => "An unexpected error occurred while checking formats.",
        }
    }
}

/// Result type alias for rsmsl operations.
pub type Result<T> = std::result::Result<T, Error>;
