// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation loop.
//!
//! Periodically compares the store, the in-memory caches and the live
//! executors, and repairs any drift:
//!
//! - queued executions missing from the dispatch queue are restored
//! - stale PREPARING and half-dispatched executions are put back in the queue
//! - running executions missing from the tracker are rehydrated from their
//!   stored snapshot
//! - live executors are asked for the authoritative status, which always wins
//! - executions on executors that stayed inactive beyond the grace period are
//!   requeued or failed, depending on their failover policy, and the old
//!   executor is asked to cancel its copy
//!
//! Every step re-reads the store and uses conditional updates, so running a
//! cycle twice on the same state changes nothing the second time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowgate_core::protocol::FlowStatusReport;
use flowgate_core::{Execution, ExecutionStore, Executor, FailoverPolicy, Status};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::executor_client::{ClientError, ExecutorClient, with_timeout};
use crate::finalizer::Finalizer;
use crate::metrics::DispatchMetrics;
use crate::queue::DispatchQueue;
use crate::registry::ExecutorRegistry;
use crate::tracker::ExecutionTracker;

/// Reconciler settings.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between cycles.
    pub poll_interval: Duration,
    /// Bound on a single status call.
    pub executor_timeout: Duration,
    /// How long an executor may stay inactive before its flows fail over.
    pub failover_grace: Duration,
    /// How long an execution may sit in PREPARING or half-dispatched.
    pub stale_dispatch_grace: Duration,
    /// First delay after a failed status poll.
    pub status_backoff_base: Duration,
    /// Longest delay between failed status polls.
    pub status_backoff_max: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            executor_timeout: Duration::from_secs(30),
            failover_grace: Duration::from_secs(60),
            stale_dispatch_grace: Duration::from_secs(120),
            status_backoff_base: Duration::from_secs(10),
            status_backoff_max: Duration::from_secs(300),
        }
    }
}

/// What a single cycle changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Executions put back in the queue after losing their executor.
    pub requeued: usize,
    /// Executions failed after losing their executor.
    pub failed: usize,
    /// Tracker entries rebuilt from the store.
    pub rehydrated: usize,
    /// Executions finalized from an executor report.
    pub finalized: usize,
    /// Queued executions re-added to the dispatch queue.
    pub restored: usize,
    /// Half-dispatched executions whose assignment was cleared.
    pub rolled_back: usize,
    /// Executions whose DAG snapshot was updated from an executor report.
    pub merged: usize,
    /// Tracker entries dropped because the execution is terminal.
    pub dropped: usize,
}

impl ReconcileReport {
    /// Whether the cycle changed anything.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn chrono_duration(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|e| Error::Other(format!("Invalid duration: {}", e)))
}

/// Background worker that repairs dispatcher state.
pub struct Reconciler {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<ExecutorRegistry>,
    queue: Arc<DispatchQueue>,
    tracker: Arc<ExecutionTracker>,
    client: Arc<dyn ExecutorClient>,
    finalizer: Arc<Finalizer>,
    config: ReconcilerConfig,
    metrics: Arc<DispatchMetrics>,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    /// Create a reconciler over shared dispatcher state.
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: Arc<ExecutorRegistry>,
        queue: Arc<DispatchQueue>,
        tracker: Arc<ExecutionTracker>,
        client: Arc<dyn ExecutorClient>,
        finalizer: Arc<Finalizer>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            tracker,
            client,
            finalizer,
            config,
            metrics: Arc::new(DispatchMetrics::global()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Record failover counts on `metrics` instead of the global provider.
    pub fn with_metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            failover_grace_secs = self.config.failover_grace.as_secs(),
            "Reconciler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconciler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.run_once().await {
                        Ok(report) if !report.is_empty() => {
                            info!(?report, "Reconciliation cycle repaired state");
                        }
                        Ok(_) => debug!("Reconciliation cycle found nothing to do"),
                        Err(e) => error!(error = %e, "Reconciliation cycle failed"),
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// Run one reconciliation cycle.
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        if let Err(e) = self.registry.refresh().await {
            warn!(error = %e, "Failed to refresh executor registry, using cached view");
        }

        let executions = self.store.fetch_non_terminal().await?;
        let live: HashSet<i64> = executions.iter().map(|e| e.id).collect();
        for execution_id in self.tracker.ids() {
            if !live.contains(&execution_id) {
                self.tracker.remove(execution_id);
                report.dropped += 1;
            }
        }

        let now = Utc::now();
        for execution in &executions {
            if let Err(e) = self.reconcile_one(execution, now, &mut report).await {
                error!(execution_id = execution.id, error = %e, "Failed to reconcile execution");
            }
        }

        self.rebuild_loads().await?;
        Ok(report)
    }

    async fn reconcile_one(
        &self,
        execution: &Execution,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let stale_before = now - chrono_duration(self.config.stale_dispatch_grace)?;

        match (execution.status, execution.executor_id) {
            (Status::Preparing, None) => {
                if execution.update_time < stale_before
                    && self
                        .store
                        .update_status(execution.id, &[Status::Preparing], Status::Queued)
                        .await?
                {
                    info!(execution_id = execution.id, "Queueing stale PREPARING execution");
                    self.restore(execution.id, report).await?;
                }
            }
            (Status::Queued, None) => {
                if self.queue.restore(execution).await {
                    debug!(execution_id = execution.id, "Restored execution to dispatch queue");
                    report.restored += 1;
                }
            }
            (Status::Queued, Some(executor_id)) => {
                if execution.update_time < stale_before
                    && self.store.unassign(execution.id, executor_id, None).await?
                {
                    warn!(execution_id = execution.id, executor_id, "Rolling back stale dispatch");
                    report.rolled_back += 1;
                    self.restore(execution.id, report).await?;
                }
            }
            (Status::Running | Status::Unknown, Some(executor_id)) => {
                match self.registry.get(executor_id) {
                    Some(executor) if executor.active => {
                        self.poll(execution, &executor, now, report).await?;
                    }
                    executor => {
                        self.check_lost(execution, executor_id, executor.as_ref(), now, report)
                            .await?;
                    }
                }
            }
            (Status::Running | Status::Unknown, None) => {
                if self
                    .store
                    .update_status(
                        execution.id,
                        &[Status::Running, Status::Unknown],
                        Status::Queued,
                    )
                    .await?
                {
                    warn!(execution_id = execution.id, "Running execution has no executor, requeueing");
                    self.tracker.remove(execution.id);
                    report.requeued += 1;
                    self.restore(execution.id, report).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn restore(&self, execution_id: i64, report: &mut ReconcileReport) -> Result<()> {
        if let Some(execution) = self.store.fetch_by_id(execution_id).await?
            && execution.status == Status::Queued
            && execution.executor_id.is_none()
            && self.queue.restore(&execution).await
        {
            report.restored += 1;
        }
        Ok(())
    }

    async fn poll(
        &self,
        execution: &Execution,
        executor: &Executor,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        if self.tracker.insert(execution) {
            info!(execution_id = execution.id, executor_id = executor.id, "Rehydrated execution");
            report.rehydrated += 1;
        }
        if !self.tracker.should_poll(execution.id, now) {
            return Ok(());
        }

        let result = with_timeout(
            executor,
            self.config.executor_timeout,
            self.client.get_status(executor, execution.id),
        )
        .await;

        match result {
            Ok(status) => {
                self.tracker.clear_backoff(execution.id);
                self.merge(execution, status, report).await
            }
            Err(ClientError::NotFound { .. }) => {
                warn!(
                    execution_id = execution.id,
                    executor = %executor.address(),
                    "Executor does not know execution, failing over"
                );
                self.failover(execution, executor.id, None, "executor lost execution", report)
                    .await
            }
            Err(e) => {
                let failures = self.tracker.record_poll_failure(
                    execution.id,
                    now,
                    self.config.status_backoff_base,
                    self.config.status_backoff_max,
                );
                warn!(
                    execution_id = execution.id,
                    executor = %executor.address(),
                    failures,
                    error = %e,
                    "Status poll failed"
                );
                Ok(())
            }
        }
    }

    async fn merge(
        &self,
        execution: &Execution,
        status: FlowStatusReport,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        if status.dag != execution.dag {
            if status.dag.same_shape(&execution.dag) {
                let lock = self.tracker.write_lock(execution.id);
                let _write = match &lock {
                    Some(lock) => Some(lock.lock().await),
                    None => None,
                };
                if self.store.update_flow_data(execution.id, &status.dag).await? {
                    let dag = status.dag.clone();
                    self.tracker
                        .with_entry_mut(execution.id, |entry| entry.machine.replace_dag(dag));
                    report.merged += 1;
                }
            } else {
                warn!(execution_id = execution.id, "Executor reported a different DAG, ignoring snapshot");
            }
        }

        if status.status.is_terminal() {
            if self
                .finalizer
                .finalize(execution.id, status.status, None)
                .await?
            {
                report.finalized += 1;
            }
        } else if execution.status == Status::Unknown
            && self
                .store
                .update_status(execution.id, &[Status::Unknown], Status::Running)
                .await?
        {
            info!(execution_id = execution.id, "Executor reachable again, execution RUNNING");
        }
        Ok(())
    }

    async fn check_lost(
        &self,
        execution: &Execution,
        executor_id: i64,
        executor: Option<&Executor>,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let lost_since = executor
            .and_then(|e| e.last_seen)
            .unwrap_or(execution.update_time);
        if now - lost_since < chrono_duration(self.config.failover_grace)? {
            if execution.status == Status::Running
                && self
                    .store
                    .update_status(execution.id, &[Status::Running], Status::Unknown)
                    .await?
            {
                warn!(execution_id = execution.id, executor_id, "Executor inactive, execution status UNKNOWN");
            }
            return Ok(());
        }
        let old = match executor {
            Some(executor) => Some(executor.clone()),
            None => self.store.fetch_executor(executor_id).await.ok().flatten(),
        };
        self.failover(execution, executor_id, old.as_ref(), "executor lost", report)
            .await
    }

    /// Move an execution off `executor_id`. When `old` is given, it is asked
    /// to cancel its copy before the execution can be dispatched again.
    async fn failover(
        &self,
        execution: &Execution,
        executor_id: i64,
        old: Option<&Executor>,
        reason: &str,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let policy = execution.options.failover_policy;
        match policy {
            FailoverPolicy::Requeue => {
                let mut dag = execution.dag.clone();
                dag.reset_for_resume();
                if self
                    .store
                    .unassign(execution.id, executor_id, Some(&dag))
                    .await?
                {
                    self.tracker.remove(execution.id);
                    self.registry.release(executor_id);
                    warn!(execution_id = execution.id, executor_id, reason, "Failing over execution to the queue");
                    self.metrics.record_failover(policy);
                    report.requeued += 1;
                    if let Some(old) = old {
                        self.cancel_best_effort(execution.id, old).await;
                    }
                    self.restore(execution.id, report).await?;
                }
            }
            FailoverPolicy::Fail => {
                if self
                    .finalizer
                    .finalize(execution.id, Status::Failed, Some(reason))
                    .await?
                {
                    warn!(execution_id = execution.id, executor_id, reason, "Failed execution after losing executor");
                    self.metrics.record_failover(policy);
                    report.failed += 1;
                    if let Some(old) = old {
                        self.cancel_best_effort(execution.id, old).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn cancel_best_effort(&self, execution_id: i64, executor: &Executor) {
        match with_timeout(
            executor,
            self.config.executor_timeout,
            self.client.cancel(executor, execution_id),
        )
        .await
        {
            Ok(_) => debug!(execution_id, executor = %executor.address(), "Cancelled copy on old executor"),
            Err(e) => {
                debug!(execution_id, executor = %executor.address(), error = %e, "Cancel on old executor failed")
            }
        }
    }

    async fn rebuild_loads(&self) -> Result<()> {
        let mut counts: HashMap<i64, usize> = HashMap::new();
        for execution in self.store.fetch_non_terminal().await? {
            if let Some(executor_id) = execution.executor_id {
                *counts.entry(executor_id).or_default() += 1;
            }
        }
        self.registry.rebuild_loads(&counts);
        Ok(())
    }
}
