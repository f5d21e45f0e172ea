// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Finalizer.
//!
//! Single path by which an execution becomes terminal. The conditional store
//! write decides the winner among concurrent callers; only the winner
//! releases executor capacity, drops in-memory state, records the finish
//! event, and notifies.

use std::sync::Arc;

use chrono::Utc;
use flowgate_core::{Event, ExecutionStore, FlowEvent, FlowEventKind, Status};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics::DispatchMetrics;
use crate::notifier::Notifier;
use crate::queue::DispatchQueue;
use crate::registry::ExecutorRegistry;
use crate::tracker::ExecutionTracker;

/// Moves executions to a terminal status exactly once.
pub struct Finalizer {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<ExecutorRegistry>,
    queue: Arc<DispatchQueue>,
    tracker: Arc<ExecutionTracker>,
    notifier: Arc<Notifier>,
    metrics: Arc<DispatchMetrics>,
}

impl Finalizer {
    /// Create a finalizer over shared dispatcher state.
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: Arc<ExecutorRegistry>,
        queue: Arc<DispatchQueue>,
        tracker: Arc<ExecutionTracker>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            tracker,
            notifier,
            metrics: Arc::new(DispatchMetrics::global()),
        }
    }

    /// Record finalize counts on `metrics` instead of the global provider.
    pub fn with_metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Finalize an execution. Returns `true` if this call did it, `false` if
    /// it was already terminal.
    pub async fn finalize(
        &self,
        execution_id: i64,
        status: Status,
        reason: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::InvalidState {
                execution_id,
                status,
            });
        }

        let execution = self
            .store
            .fetch_by_id(execution_id)
            .await?
            .ok_or(Error::ExecutionNotFound(execution_id))?;
        if execution.status.is_terminal() {
            debug!(execution_id, status = %execution.status, "Execution already finalized");
            return Ok(false);
        }

        let ended_at = Utc::now();
        if !self
            .store
            .finalize(execution_id, status, ended_at, reason)
            .await?
        {
            debug!(execution_id, "Lost finalize race");
            return Ok(false);
        }

        // The store write succeeded; cleanup below must not fail the call.
        if let Some(executor_id) = execution.executor_id {
            self.registry.release(executor_id);
        }
        self.tracker.remove(execution_id);
        self.tracker.clear_kill(execution_id);
        self.queue.remove(execution_id).await;
        self.metrics.record_finalized(status);

        let event = Event::Flow(FlowEvent::new(
            execution_id,
            FlowEventKind::Finished { status },
        ));
        if let Err(e) = self.store.append_event(&event).await {
            warn!(execution_id, error = %e, "Failed to record finish event");
        }

        info!(
            execution_id,
            flow_id = %execution.flow_id,
            status = %status,
            reason = reason.unwrap_or(""),
            "Execution finalized"
        );

        match self.store.fetch_by_id(execution_id).await {
            Ok(Some(finished)) => self.notifier.notify_finished(&finished).await,
            Ok(None) => {}
            Err(e) => warn!(execution_id, error = %e, "Failed to reload finalized execution"),
        }
        Ok(true)
    }
}
