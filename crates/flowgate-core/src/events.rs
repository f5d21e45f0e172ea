// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow and node events.
//!
//! Events are immutable once emitted. The state machine that owns the entity
//! consumes each one once; afterwards they live only in the execution event log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{NodeStatus, Status};

/// Observed node status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    /// Execution the node belongs to.
    pub execution_id: i64,
    /// Job id.
    pub job_id: String,
    /// New status.
    pub status: NodeStatus,
    /// When the change happened.
    pub at: DateTime<Utc>,
    /// Outputs reported with a SUCCEEDED node.
    #[serde(default)]
    pub generated_properties: BTreeMap<String, String>,
}

impl NodeEvent {
    /// Create an event stamped now.
    pub fn new(execution_id: i64, job_id: impl Into<String>, status: NodeStatus) -> Self {
        Self {
            execution_id,
            job_id: job_id.into(),
            status,
            at: Utc::now(),
            generated_properties: BTreeMap::new(),
        }
    }

    /// Attach generated properties.
    pub fn with_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.generated_properties = properties;
        self
    }
}

/// Flow-level event kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowEventKind {
    /// Flow started on an executor.
    Started,
    /// External kill was applied.
    Killed,
    /// First node failure in the flow.
    FirstFailure {
        /// The node that failed.
        job_id: String,
    },
    /// Flow reached a terminal status.
    Finished {
        /// Final status.
        status: Status,
    },
}

/// Observed flow-level transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    /// Execution id.
    pub execution_id: i64,
    /// What happened.
    #[serde(flatten)]
    pub kind: FlowEventKind,
    /// When.
    pub at: DateTime<Utc>,
}

impl FlowEvent {
    /// Create an event stamped now.
    pub fn new(execution_id: i64, kind: FlowEventKind) -> Self {
        Self {
            execution_id,
            kind,
            at: Utc::now(),
        }
    }
}

/// Any event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Event {
    /// Node status change.
    Node(NodeEvent),
    /// Flow transition.
    Flow(FlowEvent),
}

impl Event {
    /// Execution the event belongs to.
    pub fn execution_id(&self) -> i64 {
        match self {
            Event::Node(e) => e.execution_id,
            Event::Flow(e) => e.execution_id,
        }
    }

    /// When the event happened.
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Event::Node(e) => e.at,
            Event::Flow(e) => e.at,
        }
    }

    /// Short type label for the event log.
    pub fn label(&self) -> String {
        match self {
            Event::Node(e) => format!("node:{}:{}", e.job_id, e.status),
            Event::Flow(e) => match &e.kind {
                FlowEventKind::Started => "flow:started".to_string(),
                FlowEventKind::Killed => "flow:killed".to_string(),
                FlowEventKind::FirstFailure { job_id } => format!("flow:first_failure:{job_id}"),
                FlowEventKind::Finished { status } => format!("flow:finished:{status}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = Event::Flow(FlowEvent::new(
            5,
            FlowEventKind::Finished {
                status: Status::Failed,
            },
        ));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["scope"], "flow");
        assert_eq!(json["kind"], "finished");
        assert_eq!(json["status"], "FAILED");
        assert_eq!(event.label(), "flow:finished:FAILED");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back.execution_id(), 5);
    }

    #[test]
    fn test_node_event_label() {
        let event = Event::Node(NodeEvent::new(1, "extract", NodeStatus::Running));
        assert_eq!(event.label(), "node:extract:RUNNING");
    }
}
