// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job type `noop`.
//!
//! Node config:
//! - `sleep_ms`: wait before finishing (cancellable)
//! - `fail`: `"true"` to finish FAILED
//! - `emit.<key>`: emitted as generated property `<key>`

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use flowgate_core::job::{CancelToken, JobContext, JobError, JobOutcome, JobRunner, is_cancelled};
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runner that does nothing.
#[derive(Debug, Default)]
pub struct NoopRunner;

impl NoopRunner {
    /// Create a runner.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobRunner for NoopRunner {
    fn job_type(&self) -> &'static str {
        "noop"
    }

    async fn run(&self, ctx: &JobContext, cancel_token: CancelToken) -> Result<JobOutcome, JobError> {
        let sleep = match ctx.config.get("sleep_ms") {
            Some(raw) => Duration::from_millis(raw.trim().parse().map_err(|_| {
                JobError::InvalidConfig(format!("sleep_ms must be a number, got '{}'", raw))
            })?),
            None => Duration::ZERO,
        };

        let deadline = Instant::now() + sleep;
        while Instant::now() < deadline && !is_cancelled(&cancel_token) {
            tokio::time::sleep(POLL_INTERVAL.min(deadline - Instant::now())).await;
        }

        if is_cancelled(&cancel_token) {
            return Ok(JobOutcome::killed());
        }
        if ctx.config.get("fail").is_some_and(|v| v == "true") {
            return Ok(JobOutcome::failed());
        }
        let generated: BTreeMap<String, String> = ctx
            .config
            .iter()
            .filter_map(|(k, v)| k.strip_prefix("emit.").map(|k| (k.to_string(), v.clone())))
            .collect();
        Ok(JobOutcome::succeeded(generated))
    }
}
