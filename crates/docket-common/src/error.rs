//! Error types for docket

use thiserror::Error;

/// Result type alias for docket operations
pub type Result<T> = std::result::Result<T, DocketError>;

/// Unified error type for compilation and execution
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DocketError {
    /// Caller misuse: unknown field path, invalid option combination, empty batch
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Raised by a value encoder; passed through the compilers untouched
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("MongoDB error: {0}")]
    MongoDB(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection or server selection timeout - retryable
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Transient error that may succeed on retry
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DocketError {
    /// Returns true if this error is potentially retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, DocketError::Timeout(_) | DocketError::Transient(_))
    }

    /// Returns true if the error was caused by caller misuse and must never be retried
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            DocketError::Configuration(_) | DocketError::Validation(_)
        )
    }
}

impl From<serde_json::Error> for DocketError {
    fn from(err: serde_json::Error) -> Self {
        DocketError::Serialization(err.to_string())
    }
}

// MongoDB-specific error conversions (when mongodb-errors feature is enabled)
#[cfg(feature = "mongodb-errors")]
impl From<mongodb::error::Error> for DocketError {
    fn from(err: mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;
        match err.kind.as_ref() {
            ErrorKind::ServerSelection { .. } => DocketError::Timeout(err.to_string()),
            ErrorKind::Io(_) | ErrorKind::ConnectionPoolCleared { .. } => {
                DocketError::Transient(err.to_string())
            }
            ErrorKind::InvalidArgument { .. } => DocketError::Configuration(err.to_string()),
            _ => DocketError::MongoDB(err.to_string()),
        }
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::ser::Error> for DocketError {
    fn from(err: bson::ser::Error) -> Self {
        DocketError::Serialization(format!("BSON serialization error: {}", err))
    }
}

#[cfg(feature = "mongodb-errors")]
impl From<bson::de::Error> for DocketError {
    fn from(err: bson::de::Error) -> Self {
        DocketError::Deserialization(format!("BSON deserialization error: {}", err))
    }
}
