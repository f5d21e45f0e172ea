// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch Scheduler.
//!
//! Takes waiting executions off the [`DispatchQueue`] and binds each to the
//! least-loaded active executor. The binding is claimed with a conditional
//! store update, so several dispatchers can share one store and still assign
//! every execution at most once. The executor's acknowledgement is what
//! moves the execution to RUNNING.
//!
//! Failed submissions release the slot, clear the binding, and requeue the
//! execution until the retry ceiling is reached, after which it is failed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use flowgate_core::protocol::SubmitRequest;
use flowgate_core::{
    Event, Execution, ExecutionStore, Executor, FlowEvent, FlowEventKind, Status,
};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::executor_client::{ClientError, ExecutorClient, with_timeout};
use crate::finalizer::Finalizer;
use crate::metrics::{DispatchMetrics, SubmitOutcome};
use crate::queue::DispatchQueue;
use crate::registry::ExecutorRegistry;
use crate::tracker::ExecutionTracker;

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Idle wake-up interval when nothing signals new work.
    pub poll_interval: Duration,
    /// Bound on a single submit call.
    pub executor_timeout: Duration,
    /// Failed dispatch attempts before the execution is failed.
    pub retry_ceiling: u32,
    /// Base URL executors report node events to.
    pub callback_base_url: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            executor_timeout: Duration::from_secs(30),
            retry_ceiling: 3,
            callback_base_url: None,
        }
    }
}

/// Result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing is waiting.
    Idle,
    /// Work is waiting but no executor has capacity.
    NoCapacity,
    /// The executor accepted the execution.
    Dispatched {
        /// Execution id.
        execution_id: i64,
        /// Executor id.
        executor_id: i64,
    },
    /// Submission failed; the execution was requeued.
    Retrying {
        /// Execution id.
        execution_id: i64,
        /// Failed attempts so far.
        attempts: u32,
    },
    /// Submission failed too many times; the execution was failed.
    Failed {
        /// Execution id.
        execution_id: i64,
    },
    /// The execution was killed or changed while being dispatched.
    Cancelled {
        /// Execution id.
        execution_id: i64,
    },
}

/// Binds queued executions to executors.
pub struct Scheduler {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<ExecutorRegistry>,
    queue: Arc<DispatchQueue>,
    tracker: Arc<ExecutionTracker>,
    client: Arc<dyn ExecutorClient>,
    finalizer: Arc<Finalizer>,
    config: SchedulerConfig,
    metrics: Arc<DispatchMetrics>,
    shutdown: Arc<Notify>,
    wake: Notify,
}

impl Scheduler {
    /// Create a scheduler over shared dispatcher state.
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: Arc<ExecutorRegistry>,
        queue: Arc<DispatchQueue>,
        tracker: Arc<ExecutionTracker>,
        client: Arc<dyn ExecutorClient>,
        finalizer: Arc<Finalizer>,
        config: SchedulerConfig,
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
            wake: Notify::new(),
        }
    }

    /// Record dispatch metrics on `metrics` instead of the global provider.
    pub fn with_metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Wake the dispatch loop.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Move a PREPARING execution to QUEUED and add it to the queue.
    pub async fn enqueue(&self, execution_id: i64) -> Result<()> {
        let execution = self
            .store
            .fetch_by_id(execution_id)
            .await?
            .ok_or(Error::ExecutionNotFound(execution_id))?;

        match execution.status {
            Status::Preparing => {
                if !self
                    .store
                    .update_status(execution_id, &[Status::Preparing], Status::Queued)
                    .await?
                {
                    let current = self.current_status(execution_id).await?;
                    return Err(Error::InvalidState {
                        execution_id,
                        status: current,
                    });
                }
            }
            Status::Queued if execution.executor_id.is_none() => {}
            status => {
                return Err(Error::InvalidState {
                    execution_id,
                    status,
                });
            }
        }

        let queued = self
            .store
            .fetch_by_id(execution_id)
            .await?
            .ok_or(Error::ExecutionNotFound(execution_id))?;
        self.queue.enqueue(&queued).await?;
        debug!(execution_id, "Execution queued");
        self.wake();
        Ok(())
    }

    async fn current_status(&self, execution_id: i64) -> Result<Status> {
        Ok(self
            .store
            .fetch_by_id(execution_id)
            .await?
            .ok_or(Error::ExecutionNotFound(execution_id))?
            .status)
    }

    fn reserve_executor(&self) -> Option<Executor> {
        self.registry
            .list_active()
            .into_iter()
            .find(|candidate| self.registry.try_reserve(candidate.executor.id))
            .map(|candidate| candidate.executor)
    }

    /// Try to dispatch the next waiting execution.
    pub async fn dispatch_next(&self) -> Result<DispatchOutcome> {
        for execution_id in self.queue.snapshot().await {
            let Some(execution) = self.store.fetch_by_id(execution_id).await? else {
                self.queue.remove(execution_id).await;
                continue;
            };
            if execution.status != Status::Queued || execution.executor_id.is_some() {
                debug!(execution_id, status = %execution.status, "Dropping stale queue entry");
                self.queue.remove(execution_id).await;
                continue;
            }

            let Some(executor) = self.reserve_executor() else {
                self.metrics.record_no_capacity();
                return Ok(DispatchOutcome::NoCapacity);
            };

            let assigned = match self
                .store
                .conditional_assign(execution_id, executor.id)
                .await
            {
                Ok(assigned) => assigned,
                Err(e) => {
                    self.registry.release(executor.id);
                    return Err(e.into());
                }
            };
            if !assigned {
                self.registry.release(executor.id);
                debug!(execution_id, executor_id = executor.id, "Lost assignment race");
                self.queue.remove(execution_id).await;
                continue;
            }
            self.queue.remove(execution_id).await;

            return self.submit(execution, executor).await;
        }
        Ok(DispatchOutcome::Idle)
    }

    async fn submit(&self, execution: Execution, executor: Executor) -> Result<DispatchOutcome> {
        let execution_id = execution.id;
        let request = SubmitRequest {
            execution_id,
            flow_id: execution.flow_id.clone(),
            dag: execution.dag.clone(),
            options: execution.options.clone(),
            callback_url: self.config.callback_base_url.as_ref().map(|base| {
                format!(
                    "{}/api/v1/callbacks/{}",
                    base.trim_end_matches('/'),
                    execution_id
                )
            }),
        };

        let setup = Instant::now();
        let result = with_timeout(
            &executor,
            self.config.executor_timeout,
            self.client.submit(&executor, &request),
        )
        .await
        .and_then(|ack| {
            if ack.accepted {
                Ok(())
            } else {
                Err(ClientError::Rejected {
                    executor: executor.address(),
                    message: ack.message.unwrap_or_default(),
                })
            }
        });
        self.metrics.record_setup_time(setup.elapsed());

        let outcome = match result {
            Ok(()) => self.on_accepted(execution_id, &executor).await,
            Err(e) => self.on_submit_failed(execution_id, &executor, e).await,
        };
        match &outcome {
            Ok(DispatchOutcome::Dispatched { .. }) => {
                self.metrics.record_submit(SubmitOutcome::Success)
            }
            Ok(DispatchOutcome::Retrying { .. } | DispatchOutcome::Failed { .. }) => {
                self.metrics.record_submit(SubmitOutcome::Fail)
            }
            _ => self.metrics.record_submit(SubmitOutcome::Skip),
        }
        outcome
    }

    async fn on_accepted(&self, execution_id: i64, executor: &Executor) -> Result<DispatchOutcome> {
        if self.tracker.take_kill_request(execution_id) {
            info!(execution_id, "Kill requested during dispatch, cancelling");
            self.cancel_best_effort(execution_id, executor).await;
            self.finalizer
                .finalize(execution_id, Status::Killed, Some("killed before start"))
                .await?;
            return Ok(DispatchOutcome::Cancelled { execution_id });
        }

        if !self
            .store
            .mark_started(execution_id, executor.id, Utc::now())
            .await?
        {
            let current = self.store.fetch_by_id(execution_id).await?;
            match current {
                Some(e) if !e.status.is_terminal() => {
                    warn!(execution_id, status = %e.status, "Execution changed during dispatch, requeueing");
                    self.cancel_best_effort(execution_id, executor).await;
                    self.registry.release(executor.id);
                    if self.store.unassign(execution_id, executor.id, None).await? {
                        self.restore(execution_id).await?;
                    }
                }
                _ => {
                    debug!(execution_id, "Execution finished during dispatch");
                    self.cancel_best_effort(execution_id, executor).await;
                }
            }
            return Ok(DispatchOutcome::Cancelled { execution_id });
        }

        let started = self
            .store
            .fetch_by_id(execution_id)
            .await?
            .ok_or(Error::ExecutionNotFound(execution_id))?;
        self.tracker.insert(&started);
        self.metrics
            .record_queue_wait(started.submit_time, started.start_time.unwrap_or_else(Utc::now));
        self.store
            .append_event(&Event::Flow(FlowEvent::new(
                execution_id,
                FlowEventKind::Started,
            )))
            .await?;

        info!(
            execution_id,
            flow_id = %started.flow_id,
            executor_id = executor.id,
            executor = %executor.address(),
            "Execution dispatched"
        );
        Ok(DispatchOutcome::Dispatched {
            execution_id,
            executor_id: executor.id,
        })
    }

    async fn on_submit_failed(
        &self,
        execution_id: i64,
        executor: &Executor,
        err: ClientError,
    ) -> Result<DispatchOutcome> {
        self.registry.release(executor.id);
        if !self.store.unassign(execution_id, executor.id, None).await? {
            debug!(execution_id, "Execution changed after failed submit");
            return Ok(DispatchOutcome::Cancelled { execution_id });
        }

        if self.tracker.take_kill_request(execution_id) {
            self.finalizer
                .finalize(execution_id, Status::Killed, Some("killed before start"))
                .await?;
            return Ok(DispatchOutcome::Cancelled { execution_id });
        }

        let attempts = self.store.record_dispatch_failure(execution_id).await?;
        if attempts >= self.config.retry_ceiling {
            error!(
                execution_id,
                executor = %executor.address(),
                attempts,
                error = %err,
                "Dispatch failed, giving up"
            );
            self.finalizer
                .finalize(
                    execution_id,
                    Status::Failed,
                    Some(&format!("dispatch failure: {}", err)),
                )
                .await?;
            return Ok(DispatchOutcome::Failed { execution_id });
        }

        warn!(
            execution_id,
            executor = %executor.address(),
            attempts,
            error = %err,
            "Dispatch failed, requeueing"
        );
        self.restore(execution_id).await?;
        Ok(DispatchOutcome::Retrying {
            execution_id,
            attempts,
        })
    }

    async fn restore(&self, execution_id: i64) -> Result<()> {
        if let Some(execution) = self.store.fetch_by_id(execution_id).await? {
            self.queue.restore(&execution).await;
        }
        Ok(())
    }

    async fn cancel_best_effort(&self, execution_id: i64, executor: &Executor) {
        if let Err(e) = with_timeout(
            executor,
            self.config.executor_timeout,
            self.client.cancel(executor, execution_id),
        )
        .await
        {
            warn!(execution_id, executor = %executor.address(), error = %e, "Cancel failed");
        }
    }

    /// Dispatch until the queue is empty, capacity runs out, or a submission
    /// needs to back off.
    pub async fn drain(&self) -> usize {
        let mut dispatched = 0;
        loop {
            match self.dispatch_next().await {
                Ok(DispatchOutcome::Idle | DispatchOutcome::NoCapacity) => break,
                Ok(DispatchOutcome::Retrying { .. }) => break,
                Ok(DispatchOutcome::Dispatched { .. }) => dispatched += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Dispatch attempt failed");
                    break;
                }
            }
        }
        dispatched
    }

    /// Run the dispatch loop until shutdown.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            retry_ceiling = self.config.retry_ceiling,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }

                _ = self.wake.notified() => {
                    self.drain().await;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.drain().await;
                }
            }
        }

        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor_client::MockExecutorClient;
    use crate::metrics::testing::CapturedMetrics;
    use crate::notifier::{LoggingMailer, MailCreatorRegistry, Notifier};
    use crate::registry::RegistryConfig;
    use flowgate_core::{DagNode, ExecutionOptions, FlowDag, MemoryStore, NewExecution, SqliteStore};

    struct Fixture {
        store: Arc<dyn ExecutionStore>,
        registry: Arc<ExecutorRegistry>,
        queue: Arc<DispatchQueue>,
        tracker: Arc<ExecutionTracker>,
        client: MockExecutorClient,
        captured: CapturedMetrics,
        scheduler: Scheduler,
    }

    fn fixture(capacity: usize) -> Fixture {
        fixture_with(Arc::new(MemoryStore::new()), capacity)
    }

    fn fixture_with(store: Arc<dyn ExecutionStore>, capacity: usize) -> Fixture {
        let captured = CapturedMetrics::new();
        let registry = Arc::new(ExecutorRegistry::new(
            store.clone(),
            RegistryConfig {
                capacity,
                failure_threshold: 3,
            },
        ));
        let queue = Arc::new(DispatchQueue::default());
        let tracker = Arc::new(ExecutionTracker::new());
        let client = MockExecutorClient::new();
        let finalizer = Arc::new(
            Finalizer::new(
                store.clone(),
                registry.clone(),
                queue.clone(),
                tracker.clone(),
                Arc::new(Notifier::new(
                    MailCreatorRegistry::default(),
                    Arc::new(LoggingMailer),
                )),
            )
            .with_metrics(captured.metrics.clone()),
        );
        let scheduler = Scheduler::new(
            store.clone(),
            registry.clone(),
            queue.clone(),
            tracker.clone(),
            Arc::new(client.clone()),
            finalizer,
            SchedulerConfig {
                callback_base_url: Some("http://dispatcher:8090/".to_string()),
                ..SchedulerConfig::default()
            },
        )
        .with_metrics(captured.metrics.clone());
        Fixture {
            store,
            registry,
            queue,
            tracker,
            client,
            captured,
            scheduler,
        }
    }

    async fn submit(f: &Fixture) -> i64 {
        let execution = f
            .store
            .insert_execution(&NewExecution {
                flow_id: "flow".to_string(),
                dag: FlowDag::new(vec![DagNode::new("a", &[])]).unwrap(),
                options: ExecutionOptions::default(),
            })
            .await
            .unwrap();
        f.scheduler.enqueue(execution.id).await.unwrap();
        execution.id
    }

    #[tokio::test]
    async fn test_enqueue_moves_to_queued_once() {
        let f = fixture(1);
        let id = submit(&f).await;
        assert_eq!(
            f.store.fetch_by_id(id).await.unwrap().unwrap().status,
            Status::Queued
        );
        assert!(matches!(
            f.scheduler.enqueue(id).await,
            Err(Error::AlreadyQueued(_))
        ));
    }

    #[tokio::test]
    async fn test_idle_and_no_capacity() {
        let f = fixture(1);
        assert_eq!(f.scheduler.dispatch_next().await.unwrap(), DispatchOutcome::Idle);

        let id = submit(&f).await;
        assert_eq!(
            f.scheduler.dispatch_next().await.unwrap(),
            DispatchOutcome::NoCapacity
        );
        assert!(f.queue.contains(id).await);
        assert_eq!(f.captured.counter("flowgate.dispatch.no_capacity", None), 1);
    }

    #[tokio::test]
    async fn test_dispatch_to_least_loaded_executor() {
        let f = fixture(2);
        let a = f.registry.register("a", 1, true, "admin").await.unwrap();
        let b = f.registry.register("b", 1, true, "admin").await.unwrap();
        let first = submit(&f).await;
        let second = submit(&f).await;

        assert_eq!(f.scheduler.drain().await, 2);
        assert_eq!(f.registry.load(a.id), 1);
        assert_eq!(f.registry.load(b.id), 1);

        let stored = f.store.fetch_by_id(first).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Running);
        assert!(stored.start_time.is_some());
        assert!(f.tracker.contains(first));
        assert!(f.tracker.contains(second));
        assert_eq!(
            f.client.submissions().await,
            vec![(first, a.id), (second, b.id)]
        );
        let labels: Vec<String> = f
            .store
            .events_for(first)
            .await
            .unwrap()
            .iter()
            .map(|e| e.label())
            .collect();
        assert_eq!(labels, vec!["flow:started".to_string()]);

        let submissions = "flowgate.dispatch.submissions";
        assert_eq!(f.captured.counter(submissions, Some(("outcome", "success"))), 2);
        assert_eq!(f.captured.counter(submissions, None), 2);
        assert_eq!(f.captured.histogram_count("flowgate.dispatch.queue_wait"), 2);
        assert_eq!(f.captured.histogram_count("flowgate.dispatch.setup_time"), 2);
    }

    #[tokio::test]
    async fn test_rejected_submit_requeues_then_fails_at_ceiling() {
        let f = fixture(1);
        let a = f.registry.register("a", 1, true, "admin").await.unwrap();
        f.client.set_rejecting(a.id, true).await;
        let id = submit(&f).await;

        assert_eq!(
            f.scheduler.dispatch_next().await.unwrap(),
            DispatchOutcome::Retrying {
                execution_id: id,
                attempts: 1
            }
        );
        let stored = f.store.fetch_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Queued);
        assert_eq!(stored.executor_id, None);
        assert_eq!(f.registry.load(a.id), 0);

        f.scheduler.dispatch_next().await.unwrap();
        assert_eq!(
            f.scheduler.dispatch_next().await.unwrap(),
            DispatchOutcome::Failed { execution_id: id }
        );
        let stored = f.store.fetch_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Failed);
        assert!(
            stored
                .failure_reason
                .unwrap()
                .starts_with("dispatch failure:")
        );
        assert!(!f.queue.contains(id).await);

        assert_eq!(
            f.captured
                .counter("flowgate.dispatch.submissions", Some(("outcome", "fail"))),
            3
        );
        assert_eq!(f.captured.histogram_count("flowgate.dispatch.queue_wait"), 0);
        assert_eq!(
            f.captured
                .counter("flowgate.executions.finalized", Some(("status", "FAILED"))),
            1
        );
    }

    #[tokio::test]
    async fn test_successful_start_forgives_earlier_dispatch_failures() {
        let f = fixture(1);
        let a = f.registry.register("a", 1, true, "admin").await.unwrap();
        let id = submit(&f).await;

        f.client.set_rejecting(a.id, true).await;
        for attempts in 1..=2 {
            assert_eq!(
                f.scheduler.dispatch_next().await.unwrap(),
                DispatchOutcome::Retrying {
                    execution_id: id,
                    attempts
                }
            );
        }
        f.client.set_rejecting(a.id, false).await;
        assert!(matches!(
            f.scheduler.dispatch_next().await.unwrap(),
            DispatchOutcome::Dispatched { .. }
        ));
        assert_eq!(
            f.store.fetch_by_id(id).await.unwrap().unwrap().dispatch_attempts,
            0
        );

        // Executor lost the flow: back to the queue, where one more
        // rejection must not reach the ceiling.
        f.registry.release(a.id);
        assert!(f.store.unassign(id, a.id, None).await.unwrap());
        f.tracker.remove(id);
        let requeued = f.store.fetch_by_id(id).await.unwrap().unwrap();
        f.queue.restore(&requeued).await;

        f.client.set_rejecting(a.id, true).await;
        assert_eq!(
            f.scheduler.dispatch_next().await.unwrap(),
            DispatchOutcome::Retrying {
                execution_id: id,
                attempts: 1
            }
        );
        assert_eq!(
            f.store.fetch_by_id(id).await.unwrap().unwrap().status,
            Status::Queued
        );
    }

    #[tokio::test]
    async fn test_assign_error_releases_reserved_slot() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::new(pool.clone());
        store.migrate().await.unwrap();
        let f = fixture_with(Arc::new(store), 1);
        let a = f.registry.register("a", 1, true, "admin").await.unwrap();
        let id = submit(&f).await;

        sqlx::query(
            r#"
            CREATE TRIGGER refuse_assign BEFORE UPDATE OF executor_id ON execution_flows
            BEGIN SELECT RAISE(ABORT, 'assignments disabled'); END
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        assert!(f.scheduler.dispatch_next().await.is_err());
        assert_eq!(f.registry.load(a.id), 0);
        assert!(f.queue.contains(id).await);

        sqlx::query("DROP TRIGGER refuse_assign")
            .execute(&pool)
            .await
            .unwrap();
        assert!(matches!(
            f.scheduler.dispatch_next().await.unwrap(),
            DispatchOutcome::Dispatched { .. }
        ));
        assert_eq!(f.registry.load(a.id), 1);
    }

    #[tokio::test]
    async fn test_kill_requested_during_dispatch() {
        let f = fixture(1);
        let a = f.registry.register("a", 1, true, "admin").await.unwrap();
        let id = submit(&f).await;
        f.tracker.request_kill(id);

        assert_eq!(
            f.scheduler.dispatch_next().await.unwrap(),
            DispatchOutcome::Cancelled { execution_id: id }
        );
        assert_eq!(
            f.store.fetch_by_id(id).await.unwrap().unwrap().status,
            Status::Killed
        );
        assert_eq!(f.client.cancellations().await, vec![(id, a.id)]);
        assert_eq!(f.registry.load(a.id), 0);
        assert_eq!(
            f.captured
                .counter("flowgate.dispatch.submissions", Some(("outcome", "skip"))),
            1
        );
    }

    #[tokio::test]
    async fn test_stale_queue_entries_are_dropped() {
        let f = fixture(1);
        f.registry.register("a", 1, true, "admin").await.unwrap();
        let id = submit(&f).await;
        f.store
            .finalize(id, Status::Killed, Utc::now(), None)
            .await
            .unwrap();

        assert_eq!(f.scheduler.dispatch_next().await.unwrap(), DispatchOutcome::Idle);
        assert!(f.queue.is_empty().await);
        assert!(f.client.submissions().await.is_empty());
    }
}
