// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution, executor, and option records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::FlowDag;
use crate::status::Status;

/// Flow-level reaction to the first failed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureAction {
    /// Let running nodes finish, block everything not yet started.
    #[default]
    FinishCurrentlyRunning,
    /// Kill every non-terminal node immediately.
    CancelAll,
    /// Keep running whatever is still reachable, skip nodes downstream of the failure.
    FinishAllPossible,
}

impl FailureAction {
    /// Human readable description used in notifications.
    pub fn description(&self) -> &'static str {
        match self {
            FailureAction::FinishCurrentlyRunning => {
                "Execution is set to finish currently running jobs."
            }
            FailureAction::CancelAll => "Execution is set to kill all jobs.",
            FailureAction::FinishAllPossible => "Execution is set to complete all jobs that can run.",
        }
    }
}

/// What happens to a running flow when its executor disappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailoverPolicy {
    /// Clear the assignment and queue the flow again.
    #[default]
    Requeue,
    /// Fail the execution.
    Fail,
}

/// Options supplied with a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    /// Failure policy applied to the DAG.
    pub failure_action: FailureAction,
    /// Failover behavior when the executor is lost.
    pub failover_policy: FailoverPolicy,
    /// Execution this one is pipelined behind.
    pub pipeline_execution_id: Option<i64>,
    /// Recipients of failure notifications.
    pub failure_emails: Vec<String>,
    /// Recipients of success notifications.
    pub success_emails: Vec<String>,
    /// Send a notification as soon as the first node fails.
    pub notify_on_first_failure: bool,
    /// Send a notification when the flow finishes failed.
    pub notify_on_last_failure: bool,
    /// Name of the mail creator used to format notifications.
    pub mail_creator: String,
    /// Higher values are dispatched first by the priority policy.
    pub priority: i32,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            failure_action: FailureAction::default(),
            failover_policy: FailoverPolicy::default(),
            pipeline_execution_id: None,
            failure_emails: Vec::new(),
            success_emails: Vec::new(),
            notify_on_first_failure: false,
            notify_on_last_failure: true,
            mail_creator: "default".to_string(),
            priority: 0,
        }
    }
}

/// A remote executor process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executor {
    /// Executor id.
    pub id: i64,
    /// Host name.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Whether the executor may receive new work.
    pub active: bool,
    /// Last successful health check.
    pub last_seen: Option<DateTime<Utc>>,
}

impl Executor {
    /// `host:port` address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "executor {} ({}:{})", self.id, self.host, self.port)
    }
}

/// Stored execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Monotonically increasing id.
    pub id: i64,
    /// Flow name.
    pub flow_id: String,
    /// DAG snapshot.
    pub dag: FlowDag,
    /// Overall status.
    pub status: Status,
    /// Assigned executor.
    pub executor_id: Option<i64>,
    /// Submission options.
    pub options: ExecutionOptions,
    /// When the execution was submitted.
    pub submit_time: DateTime<Utc>,
    /// When an executor accepted it.
    pub start_time: Option<DateTime<Utc>>,
    /// When it reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Last write.
    pub update_time: DateTime<Utc>,
    /// Number of failed dispatch attempts.
    pub dispatch_attempts: u32,
    /// Sequencing token bumped on every write.
    pub update_version: i64,
    /// Reason recorded with a terminal status.
    pub failure_reason: Option<String>,
}

impl Execution {
    /// The binding to its executor, if dispatched.
    pub fn reference(&self) -> Option<ExecutionReference> {
        self.executor_id.map(|executor_id| ExecutionReference {
            execution_id: self.id,
            executor_id,
        })
    }

    /// Duration between start and end, when both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Binding of an execution to an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReference {
    /// Execution id.
    pub execution_id: i64,
    /// Executor id.
    pub executor_id: i64,
}

/// Input for [`crate::persistence::ExecutionStore::insert_execution`].
#[derive(Debug, Clone)]
pub struct NewExecution {
    /// Flow name.
    pub flow_id: String,
    /// Validated DAG.
    pub dag: FlowDag,
    /// Options.
    pub options: ExecutionOptions,
}

/// Executor lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutorEventType {
    /// Executor registered.
    Created,
    /// Executor activated.
    Activation,
    /// Executor deactivated.
    Inactivation,
    /// Executor host or port changed.
    HostUpdate,
}

impl ExecutorEventType {
    /// Stored string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorEventType::Created => "CREATED",
            ExecutorEventType::Activation => "ACTIVATION",
            ExecutorEventType::Inactivation => "INACTIVATION",
            ExecutorEventType::HostUpdate => "HOST_UPDATE",
        }
    }

    /// Parse a stored string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(ExecutorEventType::Created),
            "ACTIVATION" => Some(ExecutorEventType::Activation),
            "INACTIVATION" => Some(ExecutorEventType::Inactivation),
            "HOST_UPDATE" => Some(ExecutorEventType::HostUpdate),
            _ => None,
        }
    }
}

/// Logged executor lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorEvent {
    /// Executor id.
    pub executor_id: i64,
    /// Kind.
    pub event_type: ExecutorEventType,
    /// When it happened.
    pub event_time: DateTime<Utc>,
    /// Who triggered it.
    pub user: String,
    /// Free-form message.
    pub message: String,
}
