//! Error types and handling for ndk-core operations.
//!
//! This module provides a single error type covering every failure mode in the
//! knowledge core. Errors are categorized for routing (a `BadUri` is reported
//! synchronously to the caller, a `Downstream` failure becomes an
//! `ObservationError` on the affected observable) and carry a recoverability
//! hint for the retry logic applied around collaborators.
//!
//! ## Error Categories
//!
//! - **`BadUri` / `BadRequest`**: malformed input, reported synchronously
//! - **`Unavailable` / `Forbidden`**: the resource cannot be served
//! - **`Ingestion`**: content could not be turned into a bundle
//! - **`Downstream`**: a collaborator (inference, downloader, storage) failed
//! - **`Cancelled`**: the caller's cancellation signal fired
//! - **`Internal`**: invariant violations and storage write failures
//!
//! Only downstream inference and downloader failures are retried; the core
//! never retries connector calls.

use thiserror::Error;

/// The collaborator that produced a [`Error::Downstream`] failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamService {
    /// The LLM inference collaborator.
    Inference,
    /// The URL downloader collaborator.
    Downloader,
    /// The blob/object storage collaborator.
    Storage,
}

impl DownstreamService {
    /// Stable lowercase identifier used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inference => "inference",
            Self::Downloader => "downloader",
            Self::Storage => "storage",
        }
    }
}

impl std::fmt::Display for DownstreamService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The main error type for ndk-core operations.
///
/// All public functions in ndk-core return `Result<T, Error>`. Parse paths
/// fail with [`Error::BadUri`] carrying a short reason and never return
/// partial values.
#[derive(Error, Debug)]
pub enum Error {
    /// A reference string did not match the URI grammar.
    ///
    /// Covers unknown schemes, pattern mismatches, unknown suffix kinds and
    /// invalid path components. The message names the offending type and
    /// input, e.g. `invalid ResourceUri: invalid realm, got 'ndk://X/y/z'`.
    #[error("invalid URI: {0}")]
    BadUri(String),

    /// The request shape was valid but its content is not executable.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The resource exists in a known realm but cannot be served.
    ///
    /// Produced by a connector whose realm matches but which cannot locate
    /// the resource or already knows the client may not view it.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The client is not allowed to view the resource.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Content could not be ingested into a bundle.
    ///
    /// The canonical case is a single line exceeding the trim budget
    /// ("file too large").
    #[error("ingestion failed: {0}")]
    Ingestion(String),

    /// An injected collaborator failed.
    #[error("{service} error: {message}")]
    Downstream {
        /// Which collaborator failed.
        service: DownstreamService,
        /// Human-readable failure description.
        message: String,
    },

    /// The caller's cancellation signal fired before the request completed.
    #[error("cancelled")]
    Cancelled,

    /// An internal invariant was violated or a storage write failed.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed (JSON, YAML, TOML).
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl Error {
    /// Shorthand for a [`Error::BadUri`] with a formatted reason.
    pub fn bad_uri(type_name: &str, reason: &str, input: &str) -> Self {
        Self::BadUri(format!("invalid {type_name}: {reason}, got '{input}'"))
    }

    /// Shorthand for a downstream failure.
    pub fn downstream(service: DownstreamService, message: impl Into<String>) -> Self {
        Self::Downstream {
            service,
            message: message.into(),
        }
    }

    /// Check if the error might be recoverable through retry logic.
    ///
    /// Only downstream inference and downloader failures and transient I/O
    /// errors are retryable; everything else is permanent. Storage failures
    /// are deliberately not retried: a failed write leaves the journal in a
    /// known state and the whole action fails instead.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Downstream { service, .. } => {
                matches!(
                    service,
                    DownstreamService::Inference | DownstreamService::Downloader
                )
            },
            Self::Io(e) => {
                matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
                )
            },
            _ => false,
        }
    }

    /// Get the error category as a stable string identifier.
    ///
    /// Used for structured logging and for grouping errors in the final
    /// resource bundle.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::BadUri(_) => "bad_uri",
            Self::BadRequest(_) => "bad_request",
            Self::Unavailable(_) => "unavailable",
            Self::Forbidden(_) => "forbidden",
            Self::Ingestion(_) => "ingestion",
            Self::Downstream { .. } => "downstream",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Project the error into the serializable form carried by resource and
    /// observation errors in the final bundle.
    #[must_use]
    pub fn as_info(&self) -> ErrorInfo {
        ErrorInfo {
            kind: self.category().to_string(),
            message: self.to_string(),
        }
    }
}

/// Serializable error payload attached to `ResourceError` and
/// `ObservationError` records in the final bundle.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorInfo {
    /// Stable category identifier, see [`Error::category`].
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl ErrorInfo {
    /// Build an info record from a category and message.
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

/// Convenience type alias for `std::result::Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_formatting() {
        // Given: representative error variants
        let cases = vec![
            (Error::BadUri("invalid Realm, got 'X'".into()), "invalid URI"),
            (Error::Unavailable("no connector".into()), "unavailable"),
            (Error::Ingestion("The file is too large.".into()), "ingestion failed"),
            (
                Error::downstream(DownstreamService::Inference, "rate limited"),
                "inference error",
            ),
            (Error::Cancelled, "cancelled"),
        ];

        for (error, expected) in cases {
            // When: converting to string
            // Then: the message leads with its category phrase
            assert!(
                error.to_string().starts_with(expected),
                "unexpected display for {error:?}"
            );
        }
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::BadUri(String::new()).category(), "bad_uri");
        assert_eq!(Error::Forbidden(String::new()).category(), "forbidden");
        assert_eq!(
            Error::downstream(DownstreamService::Storage, "x").category(),
            "downstream"
        );
        assert_eq!(Error::Cancelled.category(), "cancelled");
        assert_eq!(Error::Internal(String::new()).category(), "internal");
    }

    #[test]
    fn test_error_recoverability() {
        // Inference and downloader failures are retryable, storage is not.
        assert!(Error::downstream(DownstreamService::Inference, "overloaded").is_recoverable());
        assert!(Error::downstream(DownstreamService::Downloader, "timeout").is_recoverable());
        assert!(!Error::downstream(DownstreamService::Storage, "disk full").is_recoverable());

        // Parse and request errors are permanent.
        assert!(!Error::BadUri("bad".into()).is_recoverable());
        assert!(!Error::BadRequest("bad".into()).is_recoverable());
        assert!(!Error::Ingestion("too large".into()).is_recoverable());
        assert!(!Error::Cancelled.is_recoverable());
    }

    #[test]
    fn test_error_as_info_round_trip() {
        let info = Error::Unavailable("gone".into()).as_info();
        assert_eq!(info.kind, "unavailable");
        assert!(info.message.contains("gone"));

        let json = serde_json::to_string(&info).unwrap();
        let back: ErrorInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn test_bad_uri_message_shape() {
        let error = Error::bad_uri("ResourceUri", "invalid realm", "ndk://X/y/z");
        assert_eq!(
            error.to_string(),
            "invalid URI: invalid ResourceUri: invalid realm, got 'ndk://X/y/z'"
        );
    }
}
