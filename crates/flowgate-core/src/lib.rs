// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowgate Core - execution model and flow state machine
//!
//! This crate holds everything the dispatcher and executor nodes share:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`status`] | Execution and node status enums |
//! | [`model`] | Execution, executor, and option records |
//! | [`dag`] | Validated, topologically ordered DAG snapshots |
//! | [`flow_state`] | Per-execution node/flow state machine and failure policies |
//! | [`events`] | Node and flow events |
//! | [`protocol`] | Wire messages between dispatcher and executors |
//! | [`job`] | Opaque job runner contract |
//! | [`persistence`] | Execution Record Store trait, SQLite and in-memory backends |
//!
//! # Execution lifecycle
//!
//! ```text
//! PREPARING ──enqueue──▶ QUEUED ──assign+submit──▶ RUNNING ──finalize──▶ SUCCEEDED
//!                          ▲                          │                   FAILED
//!                          └──────failover/rollback───┘                   KILLED
//! ```
//!
//! Terminal executions never change again. Every coordination step is a
//! conditional update on the store, so concurrent dispatchers never bind one
//! execution to two executors.

#![deny(missing_docs)]

pub mod dag;
pub mod error;
pub mod events;
pub mod flow_state;
pub mod job;
pub mod model;
pub mod persistence;
pub mod protocol;
pub mod status;

pub use dag::{DagError, DagNode, FlowDag};
pub use error::{CoreError, Result};
pub use events::{Event, FlowEvent, FlowEventKind, NodeEvent};
pub use flow_state::{FlowError, FlowStateMachine, Transition};
pub use model::{
    Execution, ExecutionOptions, ExecutionReference, Executor, ExecutorEvent, ExecutorEventType,
    FailoverPolicy, FailureAction, NewExecution,
};
pub use persistence::{ExecutionStore, MemoryStore, SqliteStore};
pub use status::{NodeStatus, Status};
