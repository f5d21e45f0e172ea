// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution manager.
//!
//! Entry point for everything that changes an execution from the outside:
//! submissions, kills, and node events pushed by executors. Also fronts the
//! operator calls on executors.

use std::sync::Arc;
use std::time::Duration;

use flowgate_core::{
    DagNode, Event, Execution, ExecutionOptions, ExecutionStore, Executor, ExecutorEvent,
    FlowDag, FlowEvent, FlowEventKind, NewExecution, NodeEvent, Status, Transition,
};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::executor_client::{ExecutorClient, with_timeout};
use crate::finalizer::Finalizer;
use crate::notifier::Notifier;
use crate::queue::DispatchQueue;
use crate::registry::ExecutorRegistry;
use crate::scheduler::Scheduler;
use crate::tracker::ExecutionTracker;

/// Outcome of a kill request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// The execution was finalized as KILLED.
    Killed,
    /// The execution is being dispatched; it is killed once the executor answers.
    Pending,
    /// The execution had already finished.
    AlreadyFinished(Status),
}

/// Front door for execution and executor operations.
pub struct ExecutionManager {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<ExecutorRegistry>,
    queue: Arc<DispatchQueue>,
    tracker: Arc<ExecutionTracker>,
    scheduler: Arc<Scheduler>,
    finalizer: Arc<Finalizer>,
    notifier: Arc<Notifier>,
    client: Arc<dyn ExecutorClient>,
    executor_timeout: Duration,
}

impl ExecutionManager {
    /// Create a manager over shared dispatcher state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: Arc<ExecutorRegistry>,
        queue: Arc<DispatchQueue>,
        tracker: Arc<ExecutionTracker>,
        scheduler: Arc<Scheduler>,
        finalizer: Arc<Finalizer>,
        notifier: Arc<Notifier>,
        client: Arc<dyn ExecutorClient>,
        executor_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            tracker,
            scheduler,
            finalizer,
            notifier,
            client,
            executor_timeout,
        }
    }

    // ========================================================================
    // Executions
    // ========================================================================

    /// Validate and store a new flow execution, then queue it for dispatch.
    pub async fn submit(
        &self,
        flow_id: &str,
        nodes: Vec<DagNode>,
        options: ExecutionOptions,
    ) -> Result<Execution> {
        if flow_id.trim().is_empty() {
            return Err(Error::InvalidRequest("flow_id must not be empty".to_string()));
        }
        let dag = FlowDag::new(nodes)?;
        if let Some(pipeline_id) = options.pipeline_execution_id
            && self.store.fetch_by_id(pipeline_id).await?.is_none()
        {
            return Err(Error::InvalidRequest(format!(
                "pipeline execution {} does not exist",
                pipeline_id
            )));
        }

        let execution = self
            .store
            .insert_execution(&NewExecution {
                flow_id: flow_id.to_string(),
                dag,
                options,
            })
            .await?;
        info!(execution_id = execution.id, flow_id, nodes = execution.dag.len(), "Execution submitted");

        self.scheduler.enqueue(execution.id).await?;
        self.get(execution.id).await
    }

    /// Fetch an execution.
    pub async fn get(&self, execution_id: i64) -> Result<Execution> {
        self.store
            .fetch_by_id(execution_id)
            .await?
            .ok_or(Error::ExecutionNotFound(execution_id))
    }

    /// Read an execution's event log.
    pub async fn events(&self, execution_id: i64) -> Result<Vec<Event>> {
        self.get(execution_id).await?;
        Ok(self.store.events_for(execution_id).await?)
    }

    /// Kill an execution.
    pub async fn kill(&self, execution_id: i64, user: &str) -> Result<KillOutcome> {
        let execution = self.get(execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(KillOutcome::AlreadyFinished(execution.status));
        }
        let reason = format!("killed by {}", user);
        info!(execution_id, user, status = %execution.status, "Kill requested");

        match (execution.status, execution.executor_id) {
            (Status::Preparing, _) | (Status::Queued, None) => {
                self.queue.remove(execution_id).await;
                self.finish_kill(execution_id, &reason).await
            }
            (Status::Queued, Some(_)) => {
                // Mid-dispatch: the scheduler checks this before committing.
                self.tracker.request_kill(execution_id);
                let current = self.get(execution_id).await?;
                match (current.status, current.executor_id) {
                    (Status::Queued, Some(_)) => Ok(KillOutcome::Pending),
                    (status, _) if status.is_terminal() => {
                        self.tracker.clear_kill(execution_id);
                        Ok(KillOutcome::AlreadyFinished(status))
                    }
                    (Status::Queued, None) => {
                        self.tracker.clear_kill(execution_id);
                        self.queue.remove(execution_id).await;
                        self.finish_kill(execution_id, &reason).await
                    }
                    _ => {
                        self.tracker.clear_kill(execution_id);
                        self.kill_running(&current, &reason).await
                    }
                }
            }
            _ => self.kill_running(&execution, &reason).await,
        }
    }

    async fn kill_running(&self, execution: &Execution, reason: &str) -> Result<KillOutcome> {
        let execution_id = execution.id;
        if let Some(executor_id) = execution.executor_id {
            self.tracker.insert(execution);
            if let Some(lock) = self.tracker.write_lock(execution_id) {
                let _write = lock.lock().await;
                let killed = self.tracker.with_entry_mut(execution_id, |entry| {
                    let transition = entry.machine.kill();
                    (transition, entry.machine.dag().clone())
                });
                if let Some((transition, dag)) = killed {
                    self.record(&transition).await?;
                    self.store.update_flow_data(execution_id, &dag).await?;
                }
            }
            self.cancel_on_executor(execution_id, executor_id).await;
        }
        self.finish_kill(execution_id, reason).await
    }

    async fn finish_kill(&self, execution_id: i64, reason: &str) -> Result<KillOutcome> {
        if self
            .finalizer
            .finalize(execution_id, Status::Killed, Some(reason))
            .await?
        {
            return Ok(KillOutcome::Killed);
        }
        let current = self.get(execution_id).await?;
        Ok(KillOutcome::AlreadyFinished(current.status))
    }

    async fn cancel_on_executor(&self, execution_id: i64, executor_id: i64) {
        let Some(executor) = self.executor_record(executor_id).await else {
            warn!(execution_id, executor_id, "Executor unknown, skipping cancel");
            return;
        };
        if let Err(e) = with_timeout(
            &executor,
            self.executor_timeout,
            self.client.cancel(&executor, execution_id),
        )
        .await
        {
            warn!(execution_id, executor = %executor.address(), error = %e, "Cancel on executor failed");
        }
    }

    async fn executor_record(&self, executor_id: i64) -> Option<Executor> {
        if let Some(executor) = self.registry.get(executor_id) {
            return Some(executor);
        }
        self.store.fetch_executor(executor_id).await.ok().flatten()
    }

    /// Consume a node event reported by an executor.
    pub async fn apply_node_event(&self, event: NodeEvent) -> Result<Transition> {
        let execution_id = event.execution_id;
        let execution = self.get(execution_id).await?;
        if execution.status.is_terminal() {
            debug!(execution_id, job_id = %event.job_id, "Ignoring event for finished execution");
            return Ok(Transition::default());
        }
        if execution.executor_id.is_none() {
            return Err(Error::InvalidState {
                execution_id,
                status: execution.status,
            });
        }
        if self.tracker.insert(&execution) {
            info!(execution_id, "Rehydrated execution from node event");
        }

        let lock = self
            .tracker
            .write_lock(execution_id)
            .ok_or(Error::ExecutionNotFound(execution_id))?;
        let write = lock.lock().await;
        let applied = self
            .tracker
            .with_entry_mut(execution_id, |entry| {
                entry
                    .machine
                    .apply(&event)
                    .map(|transition| (transition, entry.machine.dag().clone()))
            })
            .ok_or(Error::ExecutionNotFound(execution_id))?;
        let (transition, dag) = applied?;
        if transition.is_empty() {
            return Ok(transition);
        }

        self.record(&transition).await?;
        self.store.update_flow_data(execution_id, &dag).await?;
        drop(write);
        if execution.status == Status::Unknown {
            self.store
                .update_status(execution_id, &[Status::Unknown], Status::Running)
                .await?;
        }

        if let Some(job_id) = transition.first_failure() {
            info!(execution_id, job_id, "First node failure");
            let mut snapshot = execution.clone();
            snapshot.dag = dag;
            self.notifier.notify_first_failure(&snapshot).await;
        }
        if !transition.cancel.is_empty() {
            debug!(execution_id, nodes = ?transition.cancel, "Executor cancels in-flight nodes");
        }
        if let Some(status) = transition.finished() {
            self.finalizer.finalize(execution_id, status, None).await?;
        }
        Ok(transition)
    }

    async fn record(&self, transition: &Transition) -> Result<()> {
        for event in &transition.events {
            // The finalizer records the finish itself.
            if matches!(
                event,
                Event::Flow(FlowEvent {
                    kind: FlowEventKind::Finished { .. },
                    ..
                })
            ) {
                continue;
            }
            self.store.append_event(event).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Executors
    // ========================================================================

    /// Register an executor. New executors are inactive unless `active` is set.
    pub async fn register_executor(
        &self,
        host: &str,
        port: u16,
        active: bool,
        user: &str,
    ) -> Result<Executor> {
        if host.trim().is_empty() || port == 0 {
            return Err(Error::InvalidRequest("host and port are required".to_string()));
        }
        self.registry.register(host, port, active, user).await
    }

    /// Activate or deactivate an executor.
    pub async fn set_executor_active(
        &self,
        executor_id: i64,
        active: bool,
        user: &str,
    ) -> Result<Executor> {
        let message = if active {
            format!("activated by {}", user)
        } else {
            format!("deactivated by {}", user)
        };
        self.registry
            .set_active(executor_id, active, user, &message)
            .await?;
        if active {
            self.scheduler.wake();
        }
        self.executor(executor_id).await
    }

    /// Move an executor to a new address.
    pub async fn update_executor_address(
        &self,
        executor_id: i64,
        host: &str,
        port: u16,
        user: &str,
    ) -> Result<Executor> {
        self.registry
            .update_address(executor_id, host, port, user)
            .await?;
        self.executor(executor_id).await
    }

    /// Fetch an executor.
    pub async fn executor(&self, executor_id: i64) -> Result<Executor> {
        self.store
            .fetch_executor(executor_id)
            .await?
            .ok_or(Error::ExecutorNotFound(executor_id))
    }

    /// All executors.
    pub async fn executors(&self) -> Result<Vec<Executor>> {
        Ok(self.store.list_executors().await?)
    }

    /// Executor event log page.
    pub async fn executor_events(
        &self,
        executor_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ExecutorEvent>> {
        self.executor(executor_id).await?;
        Ok(self
            .store
            .executor_events(executor_id, limit, offset)
            .await?)
    }
}
