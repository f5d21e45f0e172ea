// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution Record Store.
//!
//! The store is the single source of truth for executions and executors. All
//! coordination between dispatchers goes through the conditional updates on
//! [`ExecutionStore`]: each returns `true` only when the row matched the
//! expected state and was changed. A `false` result means another actor got
//! there first and is not an error.
//!
//! Every write to an execution bumps its `update_version`.
//!
//! Two backends are provided: [`SqliteStore`] (durable) and [`MemoryStore`]
//! (tests and embedded use).

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::dag::FlowDag;
use crate::error::Result;
use crate::events::Event;
use crate::model::{Execution, Executor, ExecutorEvent, NewExecution};
use crate::status::Status;

/// Durable store of execution records, executors, and event logs.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    // ========================================================================
    // Executions
    // ========================================================================

    /// Insert a new execution with status PREPARING and a fresh id.
    async fn insert_execution(&self, new: &NewExecution) -> Result<Execution>;

    /// Fetch one execution. Corrupt rows are reported as errors.
    async fn fetch_by_id(&self, execution_id: i64) -> Result<Option<Execution>>;

    /// All executions not in a terminal status, oldest first.
    ///
    /// Rows whose flow snapshot cannot be decoded are skipped with a warning.
    async fn fetch_non_terminal(&self) -> Result<Vec<Execution>>;

    /// Non-terminal executions that have left the submission stage: anything
    /// except unassigned PREPARING rows.
    async fn fetch_active(&self) -> Result<Vec<Execution>>;

    /// Unassigned QUEUED executions ordered by submit time, then id.
    async fn fetch_queued(&self) -> Result<Vec<Execution>>;

    /// Bind an executor iff the execution is QUEUED and unassigned.
    async fn conditional_assign(&self, execution_id: i64, executor_id: i64) -> Result<bool>;

    /// Move QUEUED to RUNNING iff bound to `executor_id`. Resets the
    /// dispatch failure counter.
    async fn mark_started(
        &self,
        execution_id: i64,
        executor_id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Clear the assignment and return to QUEUED iff still bound to
    /// `executor_id` and not terminal. Optionally replaces the DAG snapshot.
    async fn unassign(
        &self,
        execution_id: i64,
        executor_id: i64,
        dag: Option<&FlowDag>,
    ) -> Result<bool>;

    /// Change status iff the current status is in `from`.
    async fn update_status(&self, execution_id: i64, from: &[Status], to: Status) -> Result<bool>;

    /// Replace the DAG snapshot iff the execution is not terminal.
    async fn update_flow_data(&self, execution_id: i64, dag: &FlowDag) -> Result<bool>;

    /// Increment and return the failed dispatch counter.
    async fn record_dispatch_failure(&self, execution_id: i64) -> Result<u32>;

    /// Persist a terminal status iff the execution is not yet terminal.
    async fn finalize(
        &self,
        execution_id: i64,
        status: Status,
        ended_at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<bool>;

    // ========================================================================
    // Executors
    // ========================================================================

    /// Register an executor. Fails if `host:port` is already registered.
    async fn register_executor(&self, host: &str, port: u16, active: bool) -> Result<Executor>;

    /// Fetch one executor.
    async fn fetch_executor(&self, executor_id: i64) -> Result<Option<Executor>>;

    /// Look up an executor by address.
    async fn fetch_executor_by_address(&self, host: &str, port: u16) -> Result<Option<Executor>>;

    /// All executors ordered by id.
    async fn list_executors(&self) -> Result<Vec<Executor>>;

    /// Change the host and port of an executor.
    async fn update_executor_address(&self, executor_id: i64, host: &str, port: u16)
    -> Result<bool>;

    /// Set the active flag. Returns `true` only when the flag changed.
    async fn set_executor_active(&self, executor_id: i64, active: bool) -> Result<bool>;

    /// Record a successful contact.
    async fn touch_executor(&self, executor_id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Append to the executor event log.
    async fn post_executor_event(&self, event: &ExecutorEvent) -> Result<()>;

    /// Read the executor event log ordered by time.
    async fn executor_events(
        &self,
        executor_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ExecutorEvent>>;

    // ========================================================================
    // Execution event log
    // ========================================================================

    /// Append a consumed event to the execution's log.
    async fn append_event(&self, event: &Event) -> Result<()>;

    /// Read an execution's event log in insertion order.
    async fn events_for(&self, execution_id: i64) -> Result<Vec<Event>>;
}
