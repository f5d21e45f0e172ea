// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Opaque job execution contract.
//!
//! Executors resolve a node's `job_type` to a [`JobRunner`] through static
//! configuration. The runner receives the node's config and merged inputs and
//! reports a terminal status plus generated properties.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::status::NodeStatus;

/// Everything a runner needs to run one node.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Execution id.
    pub execution_id: i64,
    /// Job id.
    pub job_id: String,
    /// Node configuration.
    pub config: BTreeMap<String, String>,
    /// Properties merged from upstream nodes.
    pub inputs: BTreeMap<String, String>,
}

/// Cancellation flag shared between the caller and a running job.
pub type CancelToken = Arc<AtomicBool>;

/// Create a fresh cancellation flag.
pub fn cancel_token() -> CancelToken {
    Arc::new(AtomicBool::new(false))
}

/// Whether `token` has been triggered.
pub fn is_cancelled(token: &CancelToken) -> bool {
    token.load(Ordering::Relaxed)
}

/// Trigger `token`.
pub fn cancel(token: &CancelToken) {
    token.store(true, Ordering::Relaxed);
}

/// Result of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    /// SUCCEEDED, FAILED or KILLED.
    pub status: NodeStatus,
    /// Generated properties.
    pub generated_properties: BTreeMap<String, String>,
}

impl JobOutcome {
    /// Successful outcome.
    pub fn succeeded(generated_properties: BTreeMap<String, String>) -> Self {
        Self {
            status: NodeStatus::Succeeded,
            generated_properties,
        }
    }

    /// Failed outcome.
    pub fn failed() -> Self {
        Self {
            status: NodeStatus::Failed,
            generated_properties: BTreeMap::new(),
        }
    }

    /// Killed outcome.
    pub fn killed() -> Self {
        Self {
            status: NodeStatus::Killed,
            generated_properties: BTreeMap::new(),
        }
    }
}

/// Errors a runner can raise before or while running a job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The node configuration is missing a required key or has a bad value.
    #[error("invalid job config: {0}")]
    InvalidConfig(String),
    /// The job could not be launched.
    #[error("failed to launch job: {0}")]
    Launch(String),
    /// I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs jobs of one type.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// The `job_type` this runner handles.
    fn job_type(&self) -> &'static str;

    /// Run the job to completion.
    ///
    /// Once `cancel_token` is triggered the runner stops the job and returns
    /// a KILLED outcome.
    async fn run(&self, ctx: &JobContext, cancel_token: CancelToken) -> Result<JobOutcome, JobError>;
}
