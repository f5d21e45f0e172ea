// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor Health Client.
//!
//! [`ExecutorClient`] is the request/response channel to remote executors.
//! Callers always wrap calls in [`with_timeout`] so a hung executor degrades
//! its health instead of blocking the scheduler or reconciliation loop.

pub mod http;
pub mod mock;

pub use http::{HttpClientConfig, HttpExecutorClient};
pub use mock::MockExecutorClient;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use flowgate_core::Executor;
use flowgate_core::protocol::{Ack, FlowStatusReport, PingResponse, SubmitRequest};

/// Failures talking to an executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The call did not finish in time.
    #[error("executor {executor} timed out after {timeout_ms}ms")]
    Timeout {
        /// Executor address.
        executor: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },
    /// Connection or server-side failure.
    #[error("executor {executor} unreachable: {message}")]
    Unreachable {
        /// Executor address.
        executor: String,
        /// Details.
        message: String,
    },
    /// The executor refused the request.
    #[error("executor {executor} rejected request: {message}")]
    Rejected {
        /// Executor address.
        executor: String,
        /// Details.
        message: String,
    },
    /// The executor does not know the execution.
    #[error("executor {executor} has no execution {execution_id}")]
    NotFound {
        /// Executor address.
        executor: String,
        /// Execution id.
        execution_id: i64,
    },
    /// The response could not be decoded.
    #[error("invalid response from executor {executor}: {message}")]
    Decode {
        /// Executor address.
        executor: String,
        /// Details.
        message: String,
    },
}

impl ClientError {
    /// Timeouts and transport failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout { .. } | ClientError::Unreachable { .. }
        )
    }
}

/// Request/response calls to a remote executor.
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    /// Hand an execution snapshot to the executor.
    async fn submit(&self, executor: &Executor, request: &SubmitRequest)
    -> Result<Ack, ClientError>;

    /// Ask the executor for the authoritative flow status.
    async fn get_status(
        &self,
        executor: &Executor,
        execution_id: i64,
    ) -> Result<FlowStatusReport, ClientError>;

    /// Ask the executor to kill a flow.
    async fn cancel(&self, executor: &Executor, execution_id: i64) -> Result<Ack, ClientError>;

    /// Health check.
    async fn ping(&self, executor: &Executor) -> Result<PingResponse, ClientError>;
}

/// Bound an executor call by `timeout`.
pub async fn with_timeout<T, F>(
    executor: &Executor,
    timeout: Duration,
    call: F,
) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout {
            executor: executor.address(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> Executor {
        Executor {
            id: 1,
            host: "localhost".to_string(),
            port: 9,
            active: true,
            last_seen: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_bounds_hung_calls() {
        let result: Result<(), ClientError> = with_timeout(
            &executor(),
            Duration::from_secs(5),
            std::future::pending(),
        )
        .await;
        assert_eq!(
            result,
            Err(ClientError::Timeout {
                executor: "localhost:9".to_string(),
                timeout_ms: 5000,
            })
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(
            ClientError::Unreachable {
                executor: "a".to_string(),
                message: "refused".to_string(),
            }
            .is_transient()
        );
        assert!(
            !ClientError::NotFound {
                executor: "a".to_string(),
                execution_id: 1,
            }
            .is_transient()
        );
    }
}
