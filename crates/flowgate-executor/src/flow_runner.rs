// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-flow execution on the executor node.
//!
//! Each accepted flow gets a driver task that owns a [`FlowStateMachine`]:
//!
//! ```text
//! next_runnable ──► QUEUED ──► RUNNING ──► job runner (JoinSet)
//!       ▲                                      │
//!       └──────────── apply(outcome) ◄─────────┘
//! ```
//!
//! Every node event is reported to the submission's callback URL in order.
//! A cancel request is delivered to the driver and applied as a flow kill.
//!
//! [`FlowRunner::shutdown`] stops the jobs of every running flow without
//! reporting the kills, so the dispatcher fails those flows over instead of
//! finishing them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flowgate_core::job::{self, CancelToken, JobContext, JobError, JobOutcome};
use flowgate_core::protocol::{Ack, FlowStatusReport, SubmitRequest};
use flowgate_core::{Event, FlowStateMachine, NodeEvent, NodeStatus, Transition};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::jobs::JobRunnerRegistry;
use crate::reporter::Reporter;

/// Flow runner settings.
#[derive(Debug, Clone)]
pub struct FlowRunnerConfig {
    /// Maximum flows running at once.
    pub max_flows: usize,
    /// How long a finished flow stays queryable.
    pub finished_retention: Duration,
}

impl Default for FlowRunnerConfig {
    fn default() -> Self {
        Self {
            max_flows: 30,
            finished_retention: Duration::from_secs(3600),
        }
    }
}

struct FlowState {
    machine: FlowStateMachine,
    updated_at: DateTime<Utc>,
}

struct FlowEntry {
    state: Mutex<FlowState>,
    callback_url: Option<String>,
    kill: Notify,
    finished_at: OnceLock<Instant>,
}

impl FlowEntry {
    fn is_finished(&self) -> bool {
        self.finished_at.get().is_some()
    }
}

type JobResult = std::result::Result<JobOutcome, JobError>;

/// Runs the flows submitted to this executor.
pub struct FlowRunner {
    jobs: Arc<JobRunnerRegistry>,
    reporter: Arc<dyn Reporter>,
    flows: DashMap<i64, Arc<FlowEntry>>,
    config: FlowRunnerConfig,
    stopping: AtomicBool,
}

impl FlowRunner {
    /// Create a runner.
    pub fn new(
        jobs: Arc<JobRunnerRegistry>,
        reporter: Arc<dyn Reporter>,
        config: FlowRunnerConfig,
    ) -> Self {
        Self {
            jobs,
            reporter,
            flows: DashMap::new(),
            config,
            stopping: AtomicBool::new(false),
        }
    }

    /// Accept a flow and start running it.
    ///
    /// Resubmitting a known execution is acknowledged without starting it
    /// again. Queued, running and killed nodes of the snapshot restart from
    /// READY.
    pub async fn submit(self: &Arc<Self>, request: SubmitRequest) -> Ack {
        self.prune_finished();
        let execution_id = request.execution_id;

        if self.is_stopping() {
            return Ack::rejected("executor is shutting down");
        }
        if self.flows.contains_key(&execution_id) {
            debug!(execution_id, "Flow already accepted");
            return Ack::accepted();
        }
        if self.running_flows() >= self.config.max_flows {
            warn!(execution_id, max_flows = self.config.max_flows, "Executor at capacity");
            return Ack::rejected(format!(
                "executor at capacity ({} flows)",
                self.config.max_flows
            ));
        }
        if let Err(e) = self.jobs.validate(&request.dag) {
            warn!(execution_id, error = %e, "Flow rejected");
            return Ack::rejected(e.to_string());
        }

        let mut dag = request.dag;
        dag.reset_for_resume();
        let entry = Arc::new(FlowEntry {
            state: Mutex::new(FlowState {
                machine: FlowStateMachine::new(execution_id, dag, request.options.failure_action),
                updated_at: Utc::now(),
            }),
            callback_url: request.callback_url,
            kill: Notify::new(),
            finished_at: OnceLock::new(),
        });

        match self.flows.entry(execution_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Ack::accepted(),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
        }

        info!(execution_id, flow_id = %request.flow_id, "Flow accepted");
        tokio::spawn(self.clone().drive(execution_id, entry));
        Ack::accepted()
    }

    /// Current view of a flow, if known.
    pub async fn status(&self, execution_id: i64) -> Option<FlowStatusReport> {
        let entry = self.flows.get(&execution_id)?.value().clone();
        let state = entry.state.lock().await;
        Some(FlowStatusReport {
            execution_id,
            status: state.machine.status(),
            dag: state.machine.dag().clone(),
            updated_at: state.updated_at,
        })
    }

    /// Request a flow kill.
    pub fn cancel(&self, execution_id: i64) -> Result<Ack> {
        let entry = self
            .flows
            .get(&execution_id)
            .map(|e| e.value().clone())
            .ok_or(Error::ExecutionNotFound(execution_id))?;
        if entry.is_finished() {
            return Ok(Ack {
                accepted: true,
                message: Some("already finished".to_string()),
            });
        }
        info!(execution_id, "Flow cancel requested");
        entry.kill.notify_one();
        Ok(Ack::accepted())
    }

    /// Stop every running flow for an executor shutdown.
    ///
    /// Jobs are cancelled but the resulting kills are not reported, and new
    /// submissions are refused.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        for entry in self.flows.iter().filter(|e| !e.is_finished()) {
            entry.kill.notify_one();
        }
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Number of flows not yet finished.
    pub fn running_flows(&self) -> usize {
        self.flows.iter().filter(|e| !e.is_finished()).count()
    }

    /// Forget flows finished longer ago than the retention period.
    pub fn prune_finished(&self) {
        let retention = self.config.finished_retention;
        self.flows.retain(|_, entry| {
            entry
                .finished_at
                .get()
                .is_none_or(|at| at.elapsed() < retention)
        });
    }

    async fn drive(self: Arc<Self>, execution_id: i64, entry: Arc<FlowEntry>) {
        info!(execution_id, "Flow started");
        let mut tasks: JoinSet<(String, std::result::Result<JobResult, tokio::task::JoinError>)> =
            JoinSet::new();
        let mut in_flight: HashMap<String, CancelToken> = HashMap::new();

        loop {
            let (reports, launches, status) = {
                let mut state = entry.state.lock().await;
                let (reports, launches) = Self::queue_runnable(&mut state.machine);
                if !reports.is_empty() {
                    state.updated_at = Utc::now();
                }
                (reports, launches, state.machine.status())
            };
            self.report(&entry, &reports).await;

            for (ctx, job_type) in launches {
                let runner = self.jobs.get(&job_type);
                let token = job::cancel_token();
                in_flight.insert(ctx.job_id.clone(), token.clone());
                debug!(execution_id, job_id = %ctx.job_id, job_type = %job_type, "Launching job");
                tasks.spawn(async move {
                    let job_id = ctx.job_id.clone();
                    let result = match runner {
                        Some(runner) => tokio::spawn(async move { runner.run(&ctx, token).await }).await,
                        None => Ok(Err(JobError::Launch(format!(
                            "no runner for job type '{}'",
                            job_type
                        )))),
                    };
                    (job_id, result)
                });
            }

            if status.is_terminal() && tasks.is_empty() {
                break;
            }
            if tasks.is_empty() {
                error!(execution_id, "Flow has no runnable nodes left, killing it");
                self.apply_kill(&entry, &in_flight).await;
                continue;
            }

            tokio::select! {
                biased;

                _ = entry.kill.notified() => {
                    info!(execution_id, "Killing flow");
                    self.apply_kill(&entry, &in_flight).await;
                }

                Some(joined) = tasks.join_next() => {
                    let (job_id, result) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            error!(execution_id, error = %e, "Job supervisor task panicked");
                            continue;
                        }
                    };
                    let cancelled = in_flight
                        .remove(&job_id)
                        .is_some_and(|token| job::is_cancelled(&token));
                    let event = Self::outcome_event(execution_id, &job_id, result, cancelled);
                    self.apply_outcome(&entry, &in_flight, event).await;
                }
            }
        }

        let status = entry.state.lock().await.machine.status();
        let _ = entry.finished_at.set(Instant::now());
        info!(execution_id, status = %status, "Flow finished");
    }

    fn queue_runnable(machine: &mut FlowStateMachine) -> (Vec<NodeEvent>, Vec<(JobContext, String)>) {
        let execution_id = machine.execution_id();
        let mut reports = Vec::new();
        let mut launches = Vec::new();

        for queued in machine.next_runnable() {
            let launch = queued.status == NodeStatus::Queued;
            let job_id = queued.job_id.clone();
            reports.push(queued);
            if !launch {
                continue;
            }

            match machine.apply(&NodeEvent::new(execution_id, &job_id, NodeStatus::Running)) {
                Ok(transition) => reports.extend(node_events(&transition)),
                Err(e) => {
                    warn!(execution_id, job_id = %job_id, error = %e, "Cannot start node");
                    continue;
                }
            }
            if let Some(node) = machine.dag().node(&job_id) {
                launches.push((
                    JobContext {
                        execution_id,
                        job_id,
                        config: node.config.clone(),
                        inputs: node.inputs.clone(),
                    },
                    node.job_type.clone(),
                ));
            }
        }

        (reports, launches)
    }

    fn outcome_event(
        execution_id: i64,
        job_id: &str,
        result: std::result::Result<JobResult, tokio::task::JoinError>,
        cancelled: bool,
    ) -> NodeEvent {
        match result {
            Ok(Ok(outcome)) if outcome.status == NodeStatus::Killed && !cancelled => {
                warn!(execution_id, job_id, "Job reported KILLED without a cancel, marking it FAILED");
                NodeEvent::new(execution_id, job_id, NodeStatus::Failed)
            }
            Ok(Ok(outcome)) => NodeEvent::new(execution_id, job_id, outcome.status)
                .with_properties(outcome.generated_properties),
            Ok(Err(e)) => {
                warn!(execution_id, job_id, error = %e, "Job error");
                NodeEvent::new(execution_id, job_id, NodeStatus::Failed)
            }
            Err(e) => {
                error!(execution_id, job_id, error = %e, "Job task panicked");
                NodeEvent::new(execution_id, job_id, NodeStatus::Failed)
            }
        }
    }

    async fn apply_outcome(
        &self,
        entry: &FlowEntry,
        in_flight: &HashMap<String, CancelToken>,
        event: NodeEvent,
    ) {
        let transition = {
            let mut state = entry.state.lock().await;
            match state.machine.apply(&event) {
                Ok(transition) => {
                    state.updated_at = Utc::now();
                    transition
                }
                Err(e) => {
                    warn!(execution_id = event.execution_id, error = %e, "Job outcome rejected");
                    return;
                }
            }
        };
        Self::cancel_jobs(event.execution_id, &transition, in_flight);
        self.report(entry, &node_events(&transition)).await;
    }

    async fn apply_kill(&self, entry: &FlowEntry, in_flight: &HashMap<String, CancelToken>) {
        let (execution_id, transition) = {
            let mut state = entry.state.lock().await;
            let transition = state.machine.kill();
            state.updated_at = Utc::now();
            (state.machine.execution_id(), transition)
        };
        Self::cancel_jobs(execution_id, &transition, in_flight);
        if self.is_stopping() {
            info!(execution_id, "Executor stopping, flow kill not reported");
            return;
        }
        self.report(entry, &node_events(&transition)).await;
    }

    fn cancel_jobs(
        execution_id: i64,
        transition: &Transition,
        in_flight: &HashMap<String, CancelToken>,
    ) {
        for job_id in &transition.cancel {
            if let Some(token) = in_flight.get(job_id) {
                debug!(execution_id, job_id = %job_id, "Cancelling job");
                job::cancel(token);
            }
        }
    }

    async fn report(&self, entry: &FlowEntry, events: &[NodeEvent]) {
        let Some(url) = entry.callback_url.as_deref() else {
            for event in events {
                debug!(
                    execution_id = event.execution_id,
                    job_id = %event.job_id,
                    status = %event.status,
                    "Node event"
                );
            }
            return;
        };
        for event in events {
            if let Err(e) = self.reporter.report(url, event).await {
                warn!(
                    execution_id = event.execution_id,
                    job_id = %event.job_id,
                    error = %e,
                    "Failed to report node event"
                );
            }
        }
    }
}

fn node_events(transition: &Transition) -> Vec<NodeEvent> {
    transition
        .events
        .iter()
        .filter_map(|e| match e {
            Event::Node(node) => Some(node.clone()),
            Event::Flow(_) => None,
        })
        .collect()
}
