// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for flowgate-core.
//!
//! Store and model failures surface as [`CoreError`]. Conditional updates that
//! simply lose a race are reported through `bool` results, not through this type.

use std::fmt;

use crate::status::Status;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors raised by the execution record store and model conversions.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Execution was not found in the store.
    ExecutionNotFound {
        /// The execution ID that was not found.
        execution_id: i64,
    },

    /// Executor was not found in the store.
    ExecutorNotFound {
        /// The executor ID that was not found.
        executor_id: i64,
    },

    /// Execution is in a status that does not allow the requested operation.
    InvalidExecutionState {
        /// The execution ID.
        execution_id: i64,
        /// The expected status (or status set).
        expected: String,
        /// The actual status.
        actual: Status,
    },

    /// A stored value could not be decoded.
    CorruptRecord {
        /// The record kind (execution, executor, event).
        record: String,
        /// Error details.
        details: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ExecutionNotFound { .. } => "EXECUTION_NOT_FOUND",
            Self::ExecutorNotFound { .. } => "EXECUTOR_NOT_FOUND",
            Self::InvalidExecutionState { .. } => "INVALID_EXECUTION_STATE",
            Self::CorruptRecord { .. } => "CORRUPT_RECORD",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether the failure is transient infrastructure trouble worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DatabaseError { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecutionNotFound { execution_id } => {
                write!(f, "Execution '{}' not found", execution_id)
            }
            Self::ExecutorNotFound { executor_id } => {
                write!(f, "Executor '{}' not found", executor_id)
            }
            Self::InvalidExecutionState {
                execution_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Execution '{}' is in invalid state: expected '{}', got '{}'",
                    execution_id, expected, actual
                )
            }
            Self::CorruptRecord { record, details } => {
                write!(f, "Corrupt {} record: {}", record, details)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::CorruptRecord {
            record: "json".to_string(),
            details: err.to_string(),
        }
    }
}
