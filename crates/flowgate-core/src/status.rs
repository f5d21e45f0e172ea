// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution and node status enums.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Submitted and stored, not yet accepted into the dispatch queue.
    Preparing,
    /// Waiting in the dispatch queue (possibly mid-dispatch when an executor is bound).
    Queued,
    /// Accepted by an executor.
    Running,
    /// All nodes finished successfully (or were skipped/disabled).
    Succeeded,
    /// A node failed and the failure policy has resolved.
    Failed,
    /// An external kill was issued.
    Killed,
    /// Status could not be determined.
    Unknown,
}

impl Status {
    /// Terminal statuses never transition again.
    pub const TERMINAL: [Status; 3] = [Status::Succeeded, Status::Failed, Status::Killed];

    /// Statuses from which an execution may still change.
    pub const NON_TERMINAL: [Status; 4] = [
        Status::Preparing,
        Status::Queued,
        Status::Running,
        Status::Unknown,
    ];

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed | Status::Killed)
    }

    /// Get the status string as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Preparing => "PREPARING",
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Killed => "KILLED",
            Status::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PREPARING" => Ok(Status::Preparing),
            "QUEUED" => Ok(Status::Queued),
            "RUNNING" => Ok(Status::Running),
            "SUCCEEDED" => Ok(Status::Succeeded),
            "FAILED" => Ok(Status::Failed),
            "KILLED" => Ok(Status::Killed),
            "UNKNOWN" => Ok(Status::Unknown),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Status of a single node (job) inside a flow DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Not started yet.
    Ready,
    /// Handed to a job runner but not yet running.
    Queued,
    /// Job is running.
    Running,
    /// Job finished successfully.
    Succeeded,
    /// Job failed.
    Failed,
    /// Job was killed or blocked by the failure policy.
    Killed,
    /// Node is disabled and will be skipped when reached.
    Disabled,
    /// Node was skipped (disabled, or downstream of a failure).
    Skipped,
}

impl NodeStatus {
    /// Check if the node can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Killed | NodeStatus::Skipped
        )
    }

    /// Whether downstream nodes may start once this node is in this status.
    pub fn satisfies_downstream(&self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::Skipped)
    }

    /// Whether the node counts as a failure for failure-policy purposes.
    ///
    /// KILLED is not a failure: it is the result of a kill or of the
    /// failure policy reacting to a real failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, NodeStatus::Failed)
    }

    /// Whether the node is in flight (handed to a runner).
    pub fn is_active(&self) -> bool {
        matches!(self, NodeStatus::Queued | NodeStatus::Running)
    }

    /// Get the status string.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Ready => "READY",
            NodeStatus::Queued => "QUEUED",
            NodeStatus::Running => "RUNNING",
            NodeStatus::Succeeded => "SUCCEEDED",
            NodeStatus::Failed => "FAILED",
            NodeStatus::Killed => "KILLED",
            NodeStatus::Disabled => "DISABLED",
            NodeStatus::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a stored status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status '{0}'")]
pub struct UnknownStatus(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_db_string() {
        for status in Status::TERMINAL.iter().chain(Status::NON_TERMINAL.iter()) {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), *status);
        }
        assert!("DONE".parse::<Status>().is_err());
    }

    #[test]
    fn test_terminal_sets_are_disjoint() {
        for status in Status::NON_TERMINAL {
            assert!(!status.is_terminal());
        }
        for status in Status::TERMINAL {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn test_node_status_predicates() {
        assert!(NodeStatus::Skipped.satisfies_downstream());
        assert!(!NodeStatus::Disabled.satisfies_downstream());
        assert!(!NodeStatus::Disabled.is_terminal());
        assert!(NodeStatus::Failed.is_failure());
        assert!(!NodeStatus::Killed.is_failure());
        assert!(NodeStatus::Queued.is_active());
    }

    #[test]
    fn test_serde_uses_screaming_case() {
        let json = serde_json::to_string(&NodeStatus::Succeeded).unwrap();
        assert_eq!(json, "\"SUCCEEDED\"");
        let status: Status = serde_json::from_str("\"KILLED\"").unwrap();
        assert_eq!(status, Status::Killed);
    }
}
