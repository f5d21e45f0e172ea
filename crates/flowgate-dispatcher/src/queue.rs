// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch Queue.
//!
//! Ordered set of execution ids waiting for an executor. Ordering is decided
//! by a [`PriorityPolicy`]; ties break on submit time, then id. The queue is
//! an in-memory cache: the store stays authoritative and the reconciliation
//! loop restores anything missing.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use flowgate_core::Execution;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Decides the dispatch rank of an execution. Lower ranks go first.
pub trait PriorityPolicy: Send + Sync {
    /// Rank for `execution`.
    fn rank(&self, execution: &Execution) -> i64;
}

/// Strict submit-time order.
#[derive(Debug, Default, Clone, Copy)]
pub struct FifoPolicy;

impl PriorityPolicy for FifoPolicy {
    fn rank(&self, _execution: &Execution) -> i64 {
        0
    }
}

/// Orders by the `priority` submission option, highest first.
#[derive(Debug, Default, Clone, Copy)]
pub struct OptionPriorityPolicy;

impl PriorityPolicy for OptionPriorityPolicy {
    fn rank(&self, execution: &Execution) -> i64 {
        -i64::from(execution.options.priority)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    rank: i64,
    submit_time: DateTime<Utc>,
    execution_id: i64,
}

#[derive(Default)]
struct Inner {
    order: BTreeSet<QueueKey>,
    index: HashMap<i64, QueueKey>,
}

/// Ordered, de-duplicated set of waiting executions.
pub struct DispatchQueue {
    inner: Mutex<Inner>,
    policy: Box<dyn PriorityPolicy>,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new(Box::new(FifoPolicy))
    }
}

impl DispatchQueue {
    /// Create an empty queue with the given ordering.
    pub fn new(policy: Box<dyn PriorityPolicy>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            policy,
        }
    }

    fn key(&self, execution: &Execution) -> QueueKey {
        QueueKey {
            rank: self.policy.rank(execution),
            submit_time: execution.submit_time,
            execution_id: execution.id,
        }
    }

    /// Add a newly queued execution. Fails if it is already present.
    pub async fn enqueue(&self, execution: &Execution) -> Result<()> {
        if self.restore(execution).await {
            Ok(())
        } else {
            Err(Error::AlreadyQueued(execution.id))
        }
    }

    /// Add an execution if absent. Returns `true` if it was added.
    pub async fn restore(&self, execution: &Execution) -> bool {
        let key = self.key(execution);
        let mut inner = self.inner.lock().await;
        if inner.index.contains_key(&execution.id) {
            return false;
        }
        inner.order.insert(key);
        inner.index.insert(execution.id, key);
        true
    }

    /// Remove an execution. Returns `true` if it was present.
    pub async fn remove(&self, execution_id: i64) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.index.remove(&execution_id) {
            Some(key) => {
                inner.order.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Whether an execution is queued.
    pub async fn contains(&self, execution_id: i64) -> bool {
        self.inner.lock().await.index.contains_key(&execution_id)
    }

    /// Number of waiting executions.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.index.len()
    }

    /// Whether nothing is waiting.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Waiting execution ids in dispatch order.
    pub async fn snapshot(&self) -> Vec<i64> {
        self.inner
            .lock()
            .await
            .order
            .iter()
            .map(|k| k.execution_id)
            .collect()
    }
}
