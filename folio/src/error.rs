//! Error taxonomy for the accounting core. Every failure a component can
//! surface is one of these variants so the processor can pattern-match its
//! way to a PROC/ERROR/FATAL status transition without string inspection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {}", summarize(.0))]
    Validation(Vec<ValidationError>),

    #[error("business rule violated: {0}")]
    BusinessRule(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("optimistic lock mismatch on {entity} id {id}")]
    OptimisticLock { entity: &'static str, id: i64 },

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("transient io failure: {0}")]
    TransientIo(String),

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("cancelled or deadline exceeded: {0}")]
    Cancelled(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Error::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// Transient failures that a retry loop is allowed to absorb.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransientIo(_) | Error::OptimisticLock { .. } | Error::CircuitOpen(_)
        )
    }

    /// Failures that must never be retried and terminate the record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Constraint(_) | Error::BusinessRule(_) | Error::Internal(_)
        )
    }

    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            Error::Validation(errors) => errors,
            _ => &[],
        }
    }
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("{} ({})", e.message, e.code))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Stable vocabulary of validation error codes. The wire form is the
/// SCREAMING_SNAKE_CASE name.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, derive_more::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    #[display("REQUIRED")]
    Required,
    #[display("INVALID_VALUE")]
    InvalidValue,
    #[display("INVALID_CASH_TRANSACTION")]
    InvalidCashTransaction,
    #[display("INVALID_CASH_PRICE")]
    InvalidCashPrice,
    #[display("INVALID_SECURITY_TRANSACTION")]
    InvalidSecurityTransaction,
    #[display("NOT_FOUND")]
    NotFound,
    #[display("DUPLICATE_SOURCE_ID")]
    DuplicateSourceId,
    #[display("MAX_RETRIES_EXCEEDED")]
    MaxRetriesExceeded,
    #[display("NOT_PROCESSABLE")]
    NotProcessable,
    #[display("TRANSIENT")]
    Transient,
}

impl ErrorCode {
    /// Codes that describe a structurally broken record. These terminate the
    /// record as FATAL; the remaining codes leave it re-queueable.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ErrorCode::Required
                | ErrorCode::InvalidValue
                | ErrorCode::InvalidCashTransaction
                | ErrorCode::InvalidCashPrice
                | ErrorCode::InvalidSecurityTransaction
                | ErrorCode::MaxRetriesExceeded
                | ErrorCode::NotProcessable
        )
    }
}

/// One field-level validation failure, accumulated by the validator and
/// echoed back in batch responses.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub value: String,
    pub code: ErrorCode,
    pub message: String,
}

impl ValidationError {
    pub fn new(
        field: impl Into<String>,
        value: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorCode, ValidationError};

    #[test]
    fn test_that_retryable_and_fatal_partition_the_taxonomy() {
        assert!(Error::TransientIo("timeout".into()).is_retryable());
        assert!(Error::OptimisticLock {
            entity: "balance",
            id: 1
        }
        .is_retryable());
        assert!(Error::CircuitOpen("portfolio-service".into()).is_retryable());
        assert!(!Error::Constraint("cash short".into()).is_retryable());
        assert!(Error::Constraint("cash short".into()).is_fatal());
        assert!(!Error::not_found("portfolio", "P1").is_fatal());
    }

    #[test]
    fn test_that_validation_error_displays_code_and_message() {
        let err = Error::Validation(vec![ValidationError::new(
            "price",
            "-1",
            ErrorCode::InvalidValue,
            "price must not be negative",
        )]);
        let text = err.to_string();
        assert!(text.contains("INVALID_VALUE"));
        assert!(text.contains("price must not be negative"));
    }

    #[test]
    fn test_that_structural_codes_are_fatal_and_lookup_codes_are_not() {
        assert!(ErrorCode::InvalidValue.is_structural());
        assert!(ErrorCode::MaxRetriesExceeded.is_structural());
        assert!(!ErrorCode::NotFound.is_structural());
        assert!(!ErrorCode::DuplicateSourceId.is_structural());
    }
}
