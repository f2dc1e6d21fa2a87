//! Core error model.

use thiserror::Error;

/// Result type used by the core building blocks.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by identifiers, job keys and the job data map.
///
/// Runtime and scheduler concerns have their own error enums; this one stays
/// limited to value construction and conversion failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A job key or descriptor failed validation (e.g. empty name).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A job data entry exists but holds a value of another shape.
    #[error("job data '{key}' could not be converted: {reason}")]
    DataConversion { key: String, reason: String },
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn data_conversion(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DataConversion {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
