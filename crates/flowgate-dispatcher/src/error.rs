// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for flowgate-dispatcher.

use flowgate_core::{CoreError, DagError, FlowError, Status};
use thiserror::Error;

use crate::executor_client::ClientError;

/// Dispatcher errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Store operation failed.
    #[error("Store error: {0}")]
    Core(#[from] CoreError),

    /// Executor call failed.
    #[error("Executor error: {0}")]
    Client(#[from] ClientError),

    /// The submitted DAG is malformed.
    #[error("Invalid flow: {0}")]
    InvalidFlow(#[from] DagError),

    /// A node event could not be applied.
    #[error("Rejected node event: {0}")]
    Flow(#[from] FlowError),

    /// Submission options are invalid.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Execution was not found.
    #[error("Execution not found: {0}")]
    ExecutionNotFound(i64),

    /// Executor was not found.
    #[error("Executor not found: {0}")]
    ExecutorNotFound(i64),

    /// Execution is already in the dispatch queue.
    #[error("Execution {0} is already queued")]
    AlreadyQueued(i64),

    /// Execution status does not allow the operation.
    #[error("Execution {execution_id} is {status}")]
    InvalidState {
        /// Execution id.
        execution_id: i64,
        /// Current status.
        status: Status,
    },

    /// Dependency-check plugin failed.
    #[error("Plugin error: {0}")]
    Plugin(#[from] crate::dependency::PluginError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using dispatcher Error.
pub type Result<T> = std::result::Result<T, Error>;
