//! Error types for edge-trust

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type alias for edge-trust
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failed call to the cloud control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudErrorKind {
    /// Request was throttled
    Throttling,
    /// Service-side failure
    InternalServer,
    /// Caller lacks permission (often transient while policies propagate)
    AccessDenied,
    /// Service could not be reached (offline)
    Unavailable,
    /// Request was rejected as invalid
    Rejected,
}

impl fmt::Display for CloudErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Throttling => "throttling",
            Self::InternalServer => "internal-server",
            Self::AccessDenied => "access-denied",
            Self::Unavailable => "unavailable",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// edge-trust errors
#[derive(Error, Debug)]
pub enum Error {
    /// Identity could not be established
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Structurally invalid request against the session layer
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// No live session has the given id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Malformed or inconsistent group/policy configuration
    #[error("Policy error: {0}")]
    Policy(String),

    /// Invalid component configuration (CA settings, URIs, ...)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Cryptographic failure while issuing a certificate
    #[error("Certificate generation failed: {0}")]
    CertificateGeneration(String),

    /// CA material missing or unusable
    #[error("Key store error: {0}")]
    KeyStore(String),

    /// Transient failure of a cloud dependency
    #[error("Cloud service interaction failed ({kind}): {message}")]
    CloudServiceInteraction {
        /// Failure class
        kind: CloudErrorKind,
        /// Error message
        message: String,
    },

    /// Key provider temporarily unavailable
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Configuration loading error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Shutdown requested while an operation was in flight
    #[error("Shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a cloud interaction error
    pub fn cloud(kind: CloudErrorKind, message: impl Into<String>) -> Self {
        Self::CloudServiceInteraction {
            kind,
            message: message.into(),
        }
    }

    /// Whether a CA upload hitting this error should be retried.
    #[must_use]
    pub fn is_retryable_cloud_error(&self) -> bool {
        matches!(
            self,
            Self::CloudServiceInteraction {
                kind: CloudErrorKind::Throttling
                    | CloudErrorKind::InternalServer
                    | CloudErrorKind::AccessDenied,
                ..
            }
        )
    }
}
