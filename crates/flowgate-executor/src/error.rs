// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for flowgate-executor.

use thiserror::Error;

/// Executor node errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A node references a job type no runner handles.
    #[error("Unknown job type '{job_type}' for node '{job_id}'")]
    UnknownJobType {
        /// Node.
        job_id: String,
        /// Requested job type.
        job_type: String,
    },

    /// The executor does not know the execution.
    #[error("Execution not found: {0}")]
    ExecutionNotFound(i64),
}

/// Result type using executor Error.
pub type Result<T> = std::result::Result<T, Error>;
