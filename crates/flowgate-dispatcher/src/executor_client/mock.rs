// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock executor client for testing.
//!
//! Simulates a fleet of executors in memory. Individual executors can be made
//! unreachable, made to reject submissions, or made to hang.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use flowgate_core::protocol::{Ack, FlowStatusReport, PingResponse, SubmitRequest};
use flowgate_core::{Executor, Status};
use tokio::sync::Mutex;

use super::{ClientError, ExecutorClient};

#[derive(Default)]
struct MockState {
    unreachable: HashSet<i64>,
    rejecting: HashSet<i64>,
    hanging: HashSet<i64>,
    reports: HashMap<i64, FlowStatusReport>,
    submissions: Vec<(i64, i64)>,
    cancellations: Vec<(i64, i64)>,
    pings: usize,
}

/// In-memory executor fleet.
#[derive(Clone, Default)]
pub struct MockExecutorClient {
    state: Arc<Mutex<MockState>>,
}

impl MockExecutorClient {
    /// Create a client where every executor is healthy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make an executor fail every call with a transport error.
    pub async fn set_unreachable(&self, executor_id: i64, unreachable: bool) {
        let mut state = self.state.lock().await;
        if unreachable {
            state.unreachable.insert(executor_id);
        } else {
            state.unreachable.remove(&executor_id);
        }
    }

    /// Make an executor reject submissions.
    pub async fn set_rejecting(&self, executor_id: i64, rejecting: bool) {
        let mut state = self.state.lock().await;
        if rejecting {
            state.rejecting.insert(executor_id);
        } else {
            state.rejecting.remove(&executor_id);
        }
    }

    /// Make every call to an executor hang forever.
    pub async fn set_hanging(&self, executor_id: i64) {
        self.state.lock().await.hanging.insert(executor_id);
    }

    /// Set the report returned by `get_status`.
    pub async fn set_report(&self, report: FlowStatusReport) {
        self.state
            .lock()
            .await
            .reports
            .insert(report.execution_id, report);
    }

    /// Forget a flow, as if the executor restarted.
    pub async fn forget(&self, execution_id: i64) {
        self.state.lock().await.reports.remove(&execution_id);
    }

    /// Accepted submissions as `(execution_id, executor_id)`.
    pub async fn submissions(&self) -> Vec<(i64, i64)> {
        self.state.lock().await.submissions.clone()
    }

    /// Cancellations as `(execution_id, executor_id)`.
    pub async fn cancellations(&self) -> Vec<(i64, i64)> {
        self.state.lock().await.cancellations.clone()
    }

    /// Number of pings received.
    pub async fn ping_count(&self) -> usize {
        self.state.lock().await.pings
    }

    async fn check(&self, executor: &Executor) -> Result<(), ClientError> {
        let (hanging, unreachable) = {
            let state = self.state.lock().await;
            (
                state.hanging.contains(&executor.id),
                state.unreachable.contains(&executor.id),
            )
        };
        if hanging {
            std::future::pending::<()>().await;
        }
        if unreachable {
            return Err(ClientError::Unreachable {
                executor: executor.address(),
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutorClient for MockExecutorClient {
    async fn submit(
        &self,
        executor: &Executor,
        request: &SubmitRequest,
    ) -> Result<Ack, ClientError> {
        self.check(executor).await?;
        let mut state = self.state.lock().await;
        if state.rejecting.contains(&executor.id) {
            return Ok(Ack::rejected("executor is not accepting flows"));
        }
        state
            .submissions
            .push((request.execution_id, executor.id));
        state.reports.insert(
            request.execution_id,
            FlowStatusReport {
                execution_id: request.execution_id,
                status: Status::Running,
                dag: request.dag.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(Ack::accepted())
    }

    async fn get_status(
        &self,
        executor: &Executor,
        execution_id: i64,
    ) -> Result<FlowStatusReport, ClientError> {
        self.check(executor).await?;
        self.state
            .lock()
            .await
            .reports
            .get(&execution_id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound {
                executor: executor.address(),
                execution_id,
            })
    }

    async fn cancel(&self, executor: &Executor, execution_id: i64) -> Result<Ack, ClientError> {
        self.check(executor).await?;
        let mut state = self.state.lock().await;
        state.cancellations.push((execution_id, executor.id));
        if let Some(report) = state.reports.get_mut(&execution_id) {
            report.status = Status::Killed;
            report.updated_at = Utc::now();
        }
        Ok(Ack::accepted())
    }

    async fn ping(&self, executor: &Executor) -> Result<PingResponse, ClientError> {
        self.check(executor).await?;
        let mut state = self.state.lock().await;
        state.pings += 1;
        Ok(PingResponse {
            status: "alive".to_string(),
            running_flows: state.reports.len(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}
