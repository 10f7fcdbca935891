//! Error types for brgnet
//!
//! Every engine operation reports its terminal outcome through [`BrgError`].
//! The variants map one-to-one onto the caller-facing taxonomy (see
//! [`ErrorKind`]) so a thin CLI can turn any failure into a stable exit code.
//! We use `thiserror` for the definitions and `anyhow` only at the binary edge.

use thiserror::Error;

/// Main error type for brgnet operations
#[derive(Error, Debug)]
pub enum BrgError {
    /// Malformed input; not retryable without correction
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Referenced interface, peer, address or rule does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Creation on a name that is already in use
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Parameter not supported by the interface's protocol variant
    #[error("Unsupported for {variant} interfaces: {what}")]
    UnsupportedForVariant {
        /// Variant of the target interface
        variant: String,
        /// What was rejected
        what: String,
    },

    /// Kernel tunnel or packet filter call failed (rollback completed)
    #[error("Adapter failure: {0}")]
    AdapterFailure(String),

    /// Lock acquisition timed out
    #[error("Timed out waiting for lock '{0}'")]
    LockTimeout(String),

    /// Rollback after a partial failure did not converge
    #[error("Inconsistent state after {operation}: {cause}; rollback failed: {rollback}")]
    Inconsistent {
        /// Operation that failed
        operation: String,
        /// Original adapter error
        cause: String,
        /// Error raised while rolling back
        rollback: String,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal errors (worker panics, poisoned state)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using BrgError
pub type Result<T> = std::result::Result<T, BrgError>;

/// Caller-facing error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input
    InvalidArgument,
    /// Missing resource
    NotFound,
    /// Duplicate creation
    AlreadyExists,
    /// Variant does not support the request
    UnsupportedForVariant,
    /// Underlying kernel/filter call failed
    AdapterFailure,
    /// Lock contention
    LockTimeout,
    /// State drift after failed rollback
    Inconsistent,
    /// Anything else (I/O on the state store, config, internal)
    Internal,
}

impl BrgError {
    /// Classify the error into the caller taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrgError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            BrgError::NotFound(_) => ErrorKind::NotFound,
            BrgError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            BrgError::UnsupportedForVariant { .. } => ErrorKind::UnsupportedForVariant,
            BrgError::AdapterFailure(_) => ErrorKind::AdapterFailure,
            BrgError::LockTimeout(_) => ErrorKind::LockTimeout,
            BrgError::Inconsistent { .. } => ErrorKind::Inconsistent,
            BrgError::Config(_)
            | BrgError::Io(_)
            | BrgError::Serialization(_)
            | BrgError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same call can succeed without changing its input
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::AdapterFailure | ErrorKind::LockTimeout | ErrorKind::Inconsistent
        )
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Internal => 1,
            ErrorKind::InvalidArgument => 2,
            ErrorKind::NotFound => 3,
            ErrorKind::AlreadyExists => 4,
            ErrorKind::AdapterFailure => 5,
            ErrorKind::LockTimeout => 6,
            ErrorKind::Inconsistent => 7,
            ErrorKind::UnsupportedForVariant => 8,
        }
    }
}

impl From<serde_json::Error> for BrgError {
    fn from(err: serde_json::Error) -> Self {
        BrgError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BrgError {
    fn from(err: toml::de::Error) -> Self {
        BrgError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for BrgError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrgError::Internal(format!("blocking worker failed: {}", err))
    }
}
