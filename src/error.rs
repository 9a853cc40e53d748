//! Error types for the metric store

use thiserror::Error;

/// Classification of an error for callers (maps onto transport status codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Validation failure, invalid time range, malformed interval
    BadInput,
    /// Metric not found by name or id
    NotFound,
    /// Duplicate metric registration
    Conflict,
    /// Cardinality cap, bucket-count cap, or batch larger than the buffer
    ResourceExhausted,
    /// Storage or object-store I/O failure, query timeout; retryable
    Transient,
    /// Invariant violation inside the engine
    Fatal,
}

/// Main error type for the metric store
#[derive(Error, Debug)]
pub enum Error {
    /// Input failed validation; the message names the field and the reason
    #[error("invalid {field}: {message}")]
    BadInput {
        /// Field that failed validation
        field: String,
        /// Why it failed
        message: String,
    },

    /// Metric lookup failed
    #[error("metric not found: {0}")]
    NotFound(String),

    /// Metric name already registered
    #[error("metric already exists: {0}")]
    AlreadyExists(String),

    /// A resource bound was hit
    #[error("{0}")]
    ResourceExhausted(String),

    /// Filesystem failure (configuration files); retryable
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage-layer failure; retryable
    #[error("storage error: {0}")]
    Storage(String),

    /// Object-store failure; retryable
    #[error("object store error: {0}")]
    ObjectStore(String),

    /// Operation exceeded its time bound; retryable with a narrower request
    #[error("query timed out after {elapsed_ms}ms: {advice}")]
    Timeout {
        /// How long the operation ran before being cut off
        elapsed_ms: u64,
        /// What the caller can change to succeed
        advice: String,
    },

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An engine invariant was violated
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl Error {
    /// Build a BadInput error naming the offending field.
    pub fn bad_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::BadInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Classify this error for callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadInput { .. } => ErrorKind::BadInput,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::Conflict,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::Io(_) | Error::Storage(_) | Error::ObjectStore(_) | Error::Timeout { .. } => {
                ErrorKind::Transient
            }
            Error::Serialization(_) | Error::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether a caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
