// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire messages exchanged between the dispatcher and executor nodes.
//!
//! | Route (executor) | Request | Response |
//! |------------------|---------|----------|
//! | `POST /api/v1/executions` | [`SubmitRequest`] | [`Ack`] |
//! | `GET /api/v1/executions/{id}/status` | - | [`FlowStatusReport`] |
//! | `POST /api/v1/executions/{id}/cancel` | - | [`Ack`] |
//! | `GET /api/v1/ping` | - | [`PingResponse`] |
//!
//! Executors push [`NodeEvent`](crate::events::NodeEvent)s to the dispatcher's
//! `POST /api/v1/callbacks/{id}` route.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::FlowDag;
use crate::model::ExecutionOptions;
use crate::status::Status;

/// Execution snapshot handed to an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Execution id.
    pub execution_id: i64,
    /// Flow name.
    pub flow_id: String,
    /// DAG snapshot to run.
    pub dag: FlowDag,
    /// Options (failure policy in particular).
    pub options: ExecutionOptions,
    /// Where node events should be posted.
    #[serde(default)]
    pub callback_url: Option<String>,
}

/// Generic acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Whether the request was accepted.
    pub accepted: bool,
    /// Optional explanation.
    #[serde(default)]
    pub message: Option<String>,
}

impl Ack {
    /// Accepted ack.
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            message: None,
        }
    }

    /// Rejected ack with a reason.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: Some(message.into()),
        }
    }
}

/// Executor-side view of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStatusReport {
    /// Execution id.
    pub execution_id: i64,
    /// Flow status as derived on the executor.
    pub status: Status,
    /// Current DAG snapshot.
    pub dag: FlowDag,
    /// When the executor last changed the flow.
    pub updated_at: DateTime<Utc>,
}

/// Executor health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    /// Health string, `"alive"` when healthy.
    pub status: String,
    /// Number of flows currently running on the executor.
    pub running_flows: usize,
    /// Executor build version.
    pub version: String,
}

impl PingResponse {
    /// Whether the executor reports itself healthy.
    pub fn is_alive(&self) -> bool {
        self.status == "alive"
    }
}
