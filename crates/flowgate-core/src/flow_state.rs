// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-execution DAG state machine.
//!
//! [`FlowStateMachine`] owns a [`FlowDag`] and advances it as node events
//! arrive. It enforces the node transition table, applies the execution's
//! [`FailureAction`] on node failures, merges upstream generated properties
//! into downstream inputs, and derives the flow-level status.
//!
//! # Node transitions
//!
//! | From | Allowed targets |
//! |------|-----------------|
//! | READY | QUEUED, RUNNING, KILLED, SKIPPED |
//! | QUEUED | RUNNING, SUCCEEDED, FAILED, KILLED |
//! | RUNNING | SUCCEEDED, FAILED, KILLED |
//! | DISABLED | SKIPPED, KILLED |
//!
//! Re-applying the current status is a no-op. Reports for a node that was
//! already KILLED are ignored, and so are KILLED reports the flow never asked
//! for (an executor stopping mid-flow): the node keeps its status until the
//! execution fails over. Any other change out of a terminal status is
//! rejected.

use chrono::Utc;
use tracing::warn;

use crate::dag::FlowDag;
use crate::events::{Event, FlowEvent, FlowEventKind, NodeEvent};
use crate::model::FailureAction;
use crate::status::{NodeStatus, Status};

/// Errors raised while applying node events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// The event references a node that is not part of the flow.
    #[error("execution {execution_id} has no node '{job_id}'")]
    UnknownNode {
        /// Execution id.
        execution_id: i64,
        /// Job id from the event.
        job_id: String,
    },
    /// The transition is not allowed from the node's current status.
    #[error("invalid transition for node '{job_id}': {from} -> {to}")]
    InvalidTransition {
        /// Job id.
        job_id: String,
        /// Current status.
        from: NodeStatus,
        /// Requested status.
        to: NodeStatus,
    },
    /// The node cannot start before its upstream nodes finish.
    #[error("node '{job_id}' cannot start: upstream '{upstream}' is {status}")]
    DependenciesNotSatisfied {
        /// Job id.
        job_id: String,
        /// First unsatisfied upstream node.
        upstream: String,
        /// Its status.
        status: NodeStatus,
    },
}

/// Result of applying an event or a kill.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    /// Events produced, in order.
    pub events: Vec<Event>,
    /// In-flight nodes the runner must cancel.
    pub cancel: Vec<String>,
}

impl Transition {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.cancel.is_empty()
    }

    /// The final flow status, if this transition finished the flow.
    pub fn finished(&self) -> Option<Status> {
        self.events.iter().find_map(|e| match e {
            Event::Flow(FlowEvent {
                kind: FlowEventKind::Finished { status },
                ..
            }) => Some(*status),
            _ => None,
        })
    }

    /// The node that caused the first failure, if this transition recorded it.
    pub fn first_failure(&self) -> Option<&str> {
        self.events.iter().find_map(|e| match e {
            Event::Flow(FlowEvent {
                kind: FlowEventKind::FirstFailure { job_id },
                ..
            }) => Some(job_id.as_str()),
            _ => None,
        })
    }
}

/// Drives node and flow status for a single execution.
#[derive(Debug, Clone)]
pub struct FlowStateMachine {
    execution_id: i64,
    dag: FlowDag,
    failure_action: FailureAction,
    killed: bool,
    failed: bool,
    finished: bool,
}

impl FlowStateMachine {
    /// Wrap a DAG snapshot. Existing node statuses are kept.
    pub fn new(execution_id: i64, dag: FlowDag, failure_action: FailureAction) -> Self {
        let mut machine = Self {
            execution_id,
            dag,
            failure_action,
            killed: false,
            failed: false,
            finished: false,
        };
        machine.resync_flags();
        machine
    }

    /// Execution id.
    pub fn execution_id(&self) -> i64 {
        self.execution_id
    }

    /// Current DAG snapshot.
    pub fn dag(&self) -> &FlowDag {
        &self.dag
    }

    /// Consume the machine and return the DAG.
    pub fn into_dag(self) -> FlowDag {
        self.dag
    }

    /// Configured failure policy.
    pub fn failure_action(&self) -> FailureAction {
        self.failure_action
    }

    /// Whether an external kill was applied.
    pub fn is_killed(&self) -> bool {
        self.killed
    }

    /// Replace the DAG with an authoritative snapshot (for example one
    /// reported by the executor).
    pub fn replace_dag(&mut self, dag: FlowDag) {
        self.dag = dag;
        self.resync_flags();
    }

    fn resync_flags(&mut self) {
        let nodes = self.dag.nodes();
        self.failed = nodes.iter().any(|n| n.status.is_failure());
        // Killed nodes without a failure only come from a flow kill.
        if !self.failed && nodes.iter().any(|n| n.status == NodeStatus::Killed) {
            self.killed = true;
        }
        self.finished = self.status().is_terminal();
    }

    /// Flow-level status derived from node statuses.
    pub fn status(&self) -> Status {
        let nodes = self.dag.nodes();
        if nodes.iter().any(|n| n.status.is_active()) {
            return Status::Running;
        }
        if self.killed {
            return Status::Killed;
        }
        if nodes.iter().any(|n| n.status == NodeStatus::Ready) {
            return Status::Running;
        }
        if nodes.iter().any(|n| n.status.is_failure()) {
            return Status::Failed;
        }
        if nodes.iter().any(|n| n.status == NodeStatus::Killed) {
            return Status::Killed;
        }
        Status::Succeeded
    }

    /// Queue every node whose upstream nodes are done and skip disabled
    /// nodes that have been reached.
    ///
    /// Returned events with status QUEUED are the nodes to launch.
    pub fn next_runnable(&mut self) -> Vec<NodeEvent> {
        let mut produced = Vec::new();
        if self.killed {
            return produced;
        }

        for pos in 0..self.dag.len() {
            let status = self.dag.node_at(pos).status;
            if !matches!(status, NodeStatus::Ready | NodeStatus::Disabled) {
                continue;
            }
            if !self.upstream_satisfied(pos) {
                continue;
            }

            let now = Utc::now();
            let next = if status == NodeStatus::Disabled {
                NodeStatus::Skipped
            } else {
                self.merge_inputs(pos);
                NodeStatus::Queued
            };
            let node = self.dag.node_at_mut(pos);
            node.status = next;
            if next == NodeStatus::Skipped {
                node.end_time = Some(now);
            }
            produced.push(NodeEvent {
                execution_id: self.execution_id,
                job_id: node.job_id.clone(),
                status: next,
                at: now,
                generated_properties: Default::default(),
            });
        }

        produced
    }

    /// Apply an observed node status change.
    pub fn apply(&mut self, event: &NodeEvent) -> Result<Transition, FlowError> {
        let pos = self
            .dag
            .position(&event.job_id)
            .ok_or_else(|| FlowError::UnknownNode {
                execution_id: self.execution_id,
                job_id: event.job_id.clone(),
            })?;

        let from = self.dag.node_at(pos).status;
        let to = event.status;
        if from == to || from == NodeStatus::Killed {
            return Ok(Transition::default());
        }
        if to == NodeStatus::Killed && !self.killed {
            warn!(
                execution_id = self.execution_id,
                job_id = %event.job_id,
                from = %from,
                "Ignoring KILLED report the flow did not request"
            );
            return Ok(Transition::default());
        }
        if !transition_allowed(from, to) {
            return Err(FlowError::InvalidTransition {
                job_id: event.job_id.clone(),
                from,
                to,
            });
        }
        if matches!(to, NodeStatus::Queued | NodeStatus::Running) {
            self.check_upstream(pos)?;
            if from == NodeStatus::Ready {
                self.merge_inputs(pos);
            }
        }

        let node = self.dag.node_at_mut(pos);
        node.status = to;
        match to {
            NodeStatus::Running => node.start_time = Some(event.at),
            NodeStatus::Succeeded => {
                node.end_time = Some(event.at);
                node.generated_properties = event.generated_properties.clone();
            }
            s if s.is_terminal() => node.end_time = Some(event.at),
            _ => {}
        }

        let mut transition = Transition {
            events: vec![Event::Node(event.clone())],
            cancel: Vec::new(),
        };

        if to.is_failure() {
            if !self.failed {
                self.failed = true;
                transition.events.push(Event::Flow(FlowEvent {
                    execution_id: self.execution_id,
                    kind: FlowEventKind::FirstFailure {
                        job_id: event.job_id.clone(),
                    },
                    at: event.at,
                }));
            }
            self.apply_failure_policy(pos, &mut transition);
        }

        self.check_finished(&mut transition);
        Ok(transition)
    }

    /// Apply an external kill: every non-terminal node becomes KILLED.
    pub fn kill(&mut self) -> Transition {
        let mut transition = Transition::default();
        if self.finished || self.killed {
            return transition;
        }
        self.killed = true;
        transition.events.push(Event::Flow(FlowEvent::new(
            self.execution_id,
            FlowEventKind::Killed,
        )));
        self.kill_matching(&mut transition, |s| !s.is_terminal());
        self.check_finished(&mut transition);
        transition
    }

    fn apply_failure_policy(&mut self, failed_pos: usize, transition: &mut Transition) {
        match self.failure_action {
            FailureAction::CancelAll => {
                self.kill_matching(transition, |s| !s.is_terminal());
            }
            FailureAction::FinishCurrentlyRunning => {
                self.kill_matching(transition, |s| {
                    matches!(s, NodeStatus::Ready | NodeStatus::Queued)
                });
                self.skip_matching(transition, |s| s == NodeStatus::Disabled);
            }
            FailureAction::FinishAllPossible => {
                let mut stack = self.dag.downstream_of(failed_pos).to_vec();
                let mut seen = vec![false; self.dag.len()];
                while let Some(pos) = stack.pop() {
                    if std::mem::replace(&mut seen[pos], true) {
                        continue;
                    }
                    let status = self.dag.node_at(pos).status;
                    if matches!(status, NodeStatus::Ready | NodeStatus::Disabled) {
                        self.set_terminal(pos, NodeStatus::Skipped, transition);
                    }
                    stack.extend_from_slice(self.dag.downstream_of(pos));
                }
            }
        }
    }

    fn kill_matching(&mut self, transition: &mut Transition, pred: impl Fn(NodeStatus) -> bool) {
        for pos in 0..self.dag.len() {
            let status = self.dag.node_at(pos).status;
            if pred(status) {
                if status.is_active() {
                    transition.cancel.push(self.dag.node_at(pos).job_id.clone());
                }
                self.set_terminal(pos, NodeStatus::Killed, transition);
            }
        }
    }

    fn skip_matching(&mut self, transition: &mut Transition, pred: impl Fn(NodeStatus) -> bool) {
        for pos in 0..self.dag.len() {
            if pred(self.dag.node_at(pos).status) {
                self.set_terminal(pos, NodeStatus::Skipped, transition);
            }
        }
    }

    fn set_terminal(&mut self, pos: usize, status: NodeStatus, transition: &mut Transition) {
        let now = Utc::now();
        let node = self.dag.node_at_mut(pos);
        node.status = status;
        node.end_time = Some(now);
        transition.events.push(Event::Node(NodeEvent {
            execution_id: self.execution_id,
            job_id: node.job_id.clone(),
            status,
            at: now,
            generated_properties: Default::default(),
        }));
    }

    fn check_finished(&mut self, transition: &mut Transition) {
        if self.finished {
            return;
        }
        let status = self.status();
        if status.is_terminal() {
            self.finished = true;
            transition.events.push(Event::Flow(FlowEvent::new(
                self.execution_id,
                FlowEventKind::Finished { status },
            )));
        }
    }

    fn upstream_satisfied(&self, pos: usize) -> bool {
        self.dag
            .upstream_positions(pos)
            .into_iter()
            .all(|up| self.dag.node_at(up).status.satisfies_downstream())
    }

    fn check_upstream(&self, pos: usize) -> Result<(), FlowError> {
        for up in self.dag.upstream_positions(pos) {
            let upstream = self.dag.node_at(up);
            if !upstream.status.satisfies_downstream() {
                return Err(FlowError::DependenciesNotSatisfied {
                    job_id: self.dag.node_at(pos).job_id.clone(),
                    upstream: upstream.job_id.clone(),
                    status: upstream.status,
                });
            }
        }
        Ok(())
    }

    fn merge_inputs(&mut self, pos: usize) {
        let mut merged = self.dag.node_at(pos).inputs.clone();
        for up in self.dag.upstream_positions(pos) {
            merged.extend(
                self.dag
                    .node_at(up)
                    .generated_properties
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        self.dag.node_at_mut(pos).inputs = merged;
    }
}

fn transition_allowed(from: NodeStatus, to: NodeStatus) -> bool {
    use NodeStatus::*;
    matches!(
        (from, to),
        (Ready, Queued | Running | Killed | Skipped)
            | (Queued, Running | Succeeded | Failed | Killed)
            | (Running, Succeeded | Failed | Killed)
            | (Disabled, Skipped | Killed)
    )
}
