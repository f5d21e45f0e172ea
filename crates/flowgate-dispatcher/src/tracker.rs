// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Running-Execution Tracker.
//!
//! Concurrent map of executions this dispatcher believes are running, each
//! with its executor binding and the flow state machine used to consume node
//! events. Entries are also used to pace status polling of unreachable
//! executors.
//!
//! Map guards are never held across an `.await`; callers mutate entries
//! through [`ExecutionTracker::with_entry_mut`] and do their I/O afterwards.
//! Callers that persist the DAG hold the entry's [`ExecutionTracker::write_lock`]
//! from the state change until the store write, so snapshots reach the store
//! in the order they were produced.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use flowgate_core::{Execution, ExecutionOptions, ExecutionReference, FlowStateMachine};
use tokio::sync::Mutex;

/// Tracked state of one running execution.
#[derive(Debug, Clone)]
pub struct TrackedExecution {
    /// Executor binding.
    pub reference: ExecutionReference,
    /// Flow name.
    pub flow_id: String,
    /// Submission options.
    pub options: ExecutionOptions,
    /// DAG state.
    pub machine: FlowStateMachine,
    /// When the executor accepted the flow.
    pub start_time: Option<DateTime<Utc>>,
    /// Consecutive failed status polls.
    pub poll_failures: u32,
    /// Earliest time of the next status poll.
    pub next_poll_at: Option<DateTime<Utc>>,
    /// Serializes state changes with their store writes.
    write_lock: Arc<Mutex<()>>,
}

/// Executions currently bound to executors.
#[derive(Default)]
pub struct ExecutionTracker {
    entries: DashMap<i64, TrackedExecution>,
    kill_requests: DashSet<i64>,
}

impl ExecutionTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an execution. Returns `false` if it has no executor or is
    /// already tracked.
    pub fn insert(&self, execution: &Execution) -> bool {
        let Some(reference) = execution.reference() else {
            return false;
        };
        if self.entries.contains_key(&execution.id) {
            return false;
        }
        self.entries.insert(
            execution.id,
            TrackedExecution {
                reference,
                flow_id: execution.flow_id.clone(),
                options: execution.options.clone(),
                machine: FlowStateMachine::new(
                    execution.id,
                    execution.dag.clone(),
                    execution.options.failure_action,
                ),
                start_time: execution.start_time,
                poll_failures: 0,
                next_poll_at: None,
                write_lock: Arc::new(Mutex::new(())),
            },
        );
        true
    }

    /// Whether an execution is tracked.
    pub fn contains(&self, execution_id: i64) -> bool {
        self.entries.contains_key(&execution_id)
    }

    /// Stop tracking an execution.
    pub fn remove(&self, execution_id: i64) -> Option<TrackedExecution> {
        self.entries.remove(&execution_id).map(|(_, entry)| entry)
    }

    /// Tracked execution ids.
    pub fn ids(&self) -> Vec<i64> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    /// Copy of one entry.
    pub fn get(&self, execution_id: i64) -> Option<TrackedExecution> {
        self.entries.get(&execution_id).map(|e| e.clone())
    }

    /// Copy of every entry.
    pub fn snapshot(&self) -> Vec<TrackedExecution> {
        self.entries.iter().map(|e| e.clone()).collect()
    }

    /// Number of tracked executions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run `f` against an entry while holding its lock.
    pub fn with_entry_mut<R>(
        &self,
        execution_id: i64,
        f: impl FnOnce(&mut TrackedExecution) -> R,
    ) -> Option<R> {
        self.entries.get_mut(&execution_id).map(|mut e| f(&mut e))
    }

    /// Lock serializing DAG persistence for one execution.
    pub fn write_lock(&self, execution_id: i64) -> Option<Arc<Mutex<()>>> {
        self.entries
            .get(&execution_id)
            .map(|e| e.write_lock.clone())
    }

    /// Remember that a kill was requested before the flow reached its executor.
    pub fn request_kill(&self, execution_id: i64) {
        self.kill_requests.insert(execution_id);
    }

    /// Consume a pending kill request.
    pub fn take_kill_request(&self, execution_id: i64) -> bool {
        self.kill_requests.remove(&execution_id).is_some()
    }

    /// Drop a pending kill request.
    pub fn clear_kill(&self, execution_id: i64) {
        self.kill_requests.remove(&execution_id);
    }

    /// Whether the entry is due for a status poll.
    pub fn should_poll(&self, execution_id: i64, now: DateTime<Utc>) -> bool {
        self.entries
            .get(&execution_id)
            .is_none_or(|e| e.next_poll_at.is_none_or(|at| at <= now))
    }

    /// Record a failed poll and push the next one out. The delay doubles per
    /// failure from `base`, capped at `max`. Returns the failure count.
    pub fn record_poll_failure(
        &self,
        execution_id: i64,
        now: DateTime<Utc>,
        base: Duration,
        max: Duration,
    ) -> u32 {
        self.with_entry_mut(execution_id, |entry| {
            entry.poll_failures = entry.poll_failures.saturating_add(1);
            let factor = 2u32.saturating_pow(entry.poll_failures - 1);
            let delay = base.saturating_mul(factor).min(max);
            entry.next_poll_at = chrono::Duration::from_std(delay).ok().map(|d| now + d);
            entry.poll_failures
        })
        .unwrap_or(0)
    }

    /// Forget poll failures after a successful poll.
    pub fn clear_backoff(&self, execution_id: i64) {
        self.with_entry_mut(execution_id, |entry| {
            entry.poll_failures = 0;
            entry.next_poll_at = None;
        });
    }
}
