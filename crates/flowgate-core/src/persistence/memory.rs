// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory execution store.
//!
//! Mirrors the conditional semantics of the SQLite store. A single mutex
//! guards all tables, so every operation is atomic.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::ExecutionStore;
use crate::dag::FlowDag;
use crate::error::{CoreError, Result};
use crate::events::Event;
use crate::model::{Execution, Executor, ExecutorEvent, NewExecution};
use crate::status::Status;

#[derive(Default)]
struct Tables {
    next_execution_id: i64,
    next_executor_id: i64,
    executions: BTreeMap<i64, Execution>,
    executors: BTreeMap<i64, Executor>,
    executor_events: Vec<ExecutorEvent>,
    events: Vec<Event>,
}

impl Tables {
    fn execution_mut(&mut self, id: i64) -> Option<&mut Execution> {
        self.executions.get_mut(&id)
    }

    fn sorted(&self, keep: impl Fn(&Execution) -> bool) -> Vec<Execution> {
        let mut rows: Vec<Execution> = self
            .executions
            .values()
            .filter(|e| keep(e))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.submit_time.cmp(&b.submit_time).then(a.id.cmp(&b.id)));
        rows
    }
}

fn touch(execution: &mut Execution) {
    execution.update_time = Utc::now();
    execution.update_version += 1;
}

/// In-memory [`ExecutionStore`].
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn insert_execution(&self, new: &NewExecution) -> Result<Execution> {
        let mut tables = self.tables.lock().await;
        tables.next_execution_id += 1;
        let now = Utc::now();
        let execution = Execution {
            id: tables.next_execution_id,
            flow_id: new.flow_id.clone(),
            dag: new.dag.clone(),
            status: Status::Preparing,
            executor_id: None,
            options: new.options.clone(),
            submit_time: now,
            start_time: None,
            end_time: None,
            update_time: now,
            dispatch_attempts: 0,
            update_version: 0,
            failure_reason: None,
        };
        tables.executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn fetch_by_id(&self, execution_id: i64) -> Result<Option<Execution>> {
        Ok(self
            .tables
            .lock()
            .await
            .executions
            .get(&execution_id)
            .cloned())
    }

    async fn fetch_non_terminal(&self) -> Result<Vec<Execution>> {
        Ok(self
            .tables
            .lock()
            .await
            .sorted(|e| !e.status.is_terminal()))
    }

    async fn fetch_active(&self) -> Result<Vec<Execution>> {
        Ok(self.tables.lock().await.sorted(|e| {
            !e.status.is_terminal() && !(e.executor_id.is_none() && e.status == Status::Preparing)
        }))
    }

    async fn fetch_queued(&self) -> Result<Vec<Execution>> {
        Ok(self
            .tables
            .lock()
            .await
            .sorted(|e| e.status == Status::Queued && e.executor_id.is_none()))
    }

    async fn conditional_assign(&self, execution_id: i64, executor_id: i64) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.execution_mut(execution_id) {
            Some(e) if e.executor_id.is_none() && e.status == Status::Queued => {
                e.executor_id = Some(executor_id);
                touch(e);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_started(
        &self,
        execution_id: i64,
        executor_id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.execution_mut(execution_id) {
            Some(e) if e.executor_id == Some(executor_id) && e.status == Status::Queued => {
                e.status = Status::Running;
                e.start_time.get_or_insert(at);
                e.dispatch_attempts = 0;
                touch(e);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unassign(
        &self,
        execution_id: i64,
        executor_id: i64,
        dag: Option<&FlowDag>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.execution_mut(execution_id) {
            Some(e) if e.executor_id == Some(executor_id) && !e.status.is_terminal() => {
                e.executor_id = None;
                e.status = Status::Queued;
                e.start_time = None;
                if let Some(dag) = dag {
                    e.dag = dag.clone();
                }
                touch(e);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_status(&self, execution_id: i64, from: &[Status], to: Status) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.execution_mut(execution_id) {
            Some(e) if from.contains(&e.status) => {
                e.status = to;
                touch(e);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_flow_data(&self, execution_id: i64, dag: &FlowDag) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.execution_mut(execution_id) {
            Some(e) if !e.status.is_terminal() => {
                e.dag = dag.clone();
                touch(e);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_dispatch_failure(&self, execution_id: i64) -> Result<u32> {
        let mut tables = self.tables.lock().await;
        let e = tables
            .execution_mut(execution_id)
            .ok_or(CoreError::ExecutionNotFound { execution_id })?;
        e.dispatch_attempts = e.dispatch_attempts.saturating_add(1);
        touch(e);
        Ok(e.dispatch_attempts)
    }

    async fn finalize(
        &self,
        execution_id: i64,
        status: Status,
        ended_at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(CoreError::ValidationError {
                field: "status".to_string(),
                message: format!("{} is not a terminal status", status),
            });
        }
        let mut tables = self.tables.lock().await;
        match tables.execution_mut(execution_id) {
            Some(e) if !e.status.is_terminal() => {
                e.status = status;
                e.end_time = Some(ended_at);
                if let Some(reason) = reason {
                    e.failure_reason = Some(reason.to_string());
                }
                touch(e);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn register_executor(&self, host: &str, port: u16, active: bool) -> Result<Executor> {
        let mut tables = self.tables.lock().await;
        if tables
            .executors
            .values()
            .any(|e| e.host == host && e.port == port)
        {
            return Err(CoreError::ValidationError {
                field: "executor".to_string(),
                message: format!("executor {}:{} already registered", host, port),
            });
        }
        tables.next_executor_id += 1;
        let executor = Executor {
            id: tables.next_executor_id,
            host: host.to_string(),
            port,
            active,
            last_seen: None,
        };
        tables.executors.insert(executor.id, executor.clone());
        Ok(executor)
    }

    async fn fetch_executor(&self, executor_id: i64) -> Result<Option<Executor>> {
        Ok(self
            .tables
            .lock()
            .await
            .executors
            .get(&executor_id)
            .cloned())
    }

    async fn fetch_executor_by_address(&self, host: &str, port: u16) -> Result<Option<Executor>> {
        Ok(self
            .tables
            .lock()
            .await
            .executors
            .values()
            .find(|e| e.host == host && e.port == port)
            .cloned())
    }

    async fn list_executors(&self) -> Result<Vec<Executor>> {
        Ok(self
            .tables
            .lock()
            .await
            .executors
            .values()
            .cloned()
            .collect())
    }

    async fn update_executor_address(
        &self,
        executor_id: i64,
        host: &str,
        port: u16,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.executors.get_mut(&executor_id) {
            Some(e) => {
                e.host = host.to_string();
                e.port = port;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_executor_active(&self, executor_id: i64, active: bool) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.executors.get_mut(&executor_id) {
            Some(e) if e.active != active => {
                e.active = active;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch_executor(&self, executor_id: i64, at: DateTime<Utc>) -> Result<()> {
        if let Some(e) = self.tables.lock().await.executors.get_mut(&executor_id) {
            e.last_seen = Some(at);
        }
        Ok(())
    }

    async fn post_executor_event(&self, event: &ExecutorEvent) -> Result<()> {
        self.tables.lock().await.executor_events.push(event.clone());
        Ok(())
    }

    async fn executor_events(
        &self,
        executor_id: i64,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ExecutorEvent>> {
        let tables = self.tables.lock().await;
        let mut events: Vec<ExecutorEvent> = tables
            .executor_events
            .iter()
            .filter(|e| e.executor_id == executor_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps.
        events.sort_by_key(|e| e.event_time);
        Ok(events
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn append_event(&self, event: &Event) -> Result<()> {
        self.tables.lock().await.events.push(event.clone());
        Ok(())
    }

    async fn events_for(&self, execution_id: i64) -> Result<Vec<Event>> {
        Ok(self
            .tables
            .lock()
            .await
            .events
            .iter()
            .filter(|e| e.execution_id() == execution_id)
            .cloned()
            .collect())
    }
}
