// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor Registry.
//!
//! In-memory view of the executor fleet, re-synced from the store on an
//! interval. Per-executor load counters are only changed through
//! [`ExecutorRegistry::try_reserve`] and [`ExecutorRegistry::release`], both
//! atomic. The active flag is persisted before the local copy changes, and
//! every flip is written to the executor event log.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use flowgate_core::{ExecutionStore, Executor, ExecutorEvent, ExecutorEventType};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// User recorded on events raised by the dispatcher itself.
pub const SYSTEM_USER: &str = "system";

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum concurrent flows per executor.
    pub capacity: usize,
    /// Consecutive failed pings before an executor is deactivated.
    pub failure_threshold: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: 30,
            failure_threshold: 3,
        }
    }
}

struct Entry {
    executor: Executor,
    load: Arc<AtomicUsize>,
    failures: Arc<AtomicU32>,
}

/// Executor with its current load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSnapshot {
    /// Executor record.
    pub executor: Executor,
    /// Flows currently assigned.
    pub load: usize,
}

/// Live view of the executor fleet.
pub struct ExecutorRegistry {
    store: Arc<dyn ExecutionStore>,
    entries: DashMap<i64, Entry>,
    config: RegistryConfig,
}

impl ExecutorRegistry {
    /// Create an empty registry. Call [`refresh`](Self::refresh) to load it.
    pub fn new(store: Arc<dyn ExecutionStore>, config: RegistryConfig) -> Self {
        Self {
            store,
            entries: DashMap::new(),
            config,
        }
    }

    /// Re-read executors from the store, keeping load counters.
    pub async fn refresh(&self) -> Result<()> {
        let executors = self.store.list_executors().await?;
        let ids: Vec<i64> = executors.iter().map(|e| e.id).collect();

        for executor in executors {
            match self.entries.get_mut(&executor.id) {
                Some(mut entry) => entry.executor = executor,
                None => {
                    self.entries.insert(
                        executor.id,
                        Entry {
                            executor,
                            load: Arc::new(AtomicUsize::new(0)),
                            failures: Arc::new(AtomicU32::new(0)),
                        },
                    );
                }
            }
        }
        self.entries.retain(|id, _| ids.contains(id));
        Ok(())
    }

    /// Active executors ordered by load, then id.
    pub fn list_active(&self) -> Vec<ExecutorSnapshot> {
        let mut active: Vec<ExecutorSnapshot> = self
            .entries
            .iter()
            .filter(|e| e.executor.active)
            .map(|e| ExecutorSnapshot {
                executor: e.executor.clone(),
                load: e.load.load(Ordering::SeqCst),
            })
            .collect();
        active.sort_by_key(|s| (s.load, s.executor.id));
        active
    }

    /// All known executors ordered by id.
    pub fn list_all(&self) -> Vec<Executor> {
        let mut all: Vec<Executor> = self.entries.iter().map(|e| e.executor.clone()).collect();
        all.sort_by_key(|e| e.id);
        all
    }

    /// Cached executor record.
    pub fn get(&self, executor_id: i64) -> Option<Executor> {
        self.entries.get(&executor_id).map(|e| e.executor.clone())
    }

    /// Whether the cached record says the executor is active.
    pub fn is_active(&self, executor_id: i64) -> bool {
        self.entries
            .get(&executor_id)
            .is_some_and(|e| e.executor.active)
    }

    /// Current load of an executor.
    pub fn load(&self, executor_id: i64) -> usize {
        self.entries
            .get(&executor_id)
            .map_or(0, |e| e.load.load(Ordering::SeqCst))
    }

    /// Take one slot on an active executor with spare capacity.
    pub fn try_reserve(&self, executor_id: i64) -> bool {
        let Some(load) = self
            .entries
            .get(&executor_id)
            .filter(|e| e.executor.active)
            .map(|e| e.load.clone())
        else {
            return false;
        };
        let capacity = self.config.capacity;
        load.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            (current < capacity).then_some(current + 1)
        })
        .is_ok()
    }

    /// Give a slot back.
    pub fn release(&self, executor_id: i64) {
        if let Some(load) = self.entries.get(&executor_id).map(|e| e.load.clone()) {
            let _ = load.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(1))
            });
        }
    }

    /// Overwrite load counters from authoritative assignment counts.
    pub fn rebuild_loads(&self, counts: &HashMap<i64, usize>) {
        for entry in self.entries.iter() {
            let count = counts.get(entry.key()).copied().unwrap_or(0);
            entry.load.store(count, Ordering::SeqCst);
        }
    }

    /// Record a successful health check.
    pub async fn record_ping_success(&self, executor_id: i64) -> Result<()> {
        let now = Utc::now();
        if let Some(mut entry) = self.entries.get_mut(&executor_id) {
            entry.failures.store(0, Ordering::SeqCst);
            entry.executor.last_seen = Some(now);
        }
        self.store.touch_executor(executor_id, now).await?;
        Ok(())
    }

    /// Record a failed health check. Returns `true` if the executor was
    /// deactivated as a result.
    pub async fn record_ping_failure(&self, executor_id: i64) -> Result<bool> {
        let Some(failures) = self.entries.get(&executor_id).map(|e| e.failures.clone()) else {
            return Ok(false);
        };
        let count = failures.fetch_add(1, Ordering::SeqCst) + 1;
        if count < self.config.failure_threshold || !self.is_active(executor_id) {
            return Ok(false);
        }

        warn!(
            executor_id,
            consecutive_failures = count,
            "Executor failed health checks, deactivating"
        );
        self.set_active(
            executor_id,
            false,
            SYSTEM_USER,
            &format!("{} consecutive health check failures", count),
        )
        .await
    }

    /// Register a new executor and log its creation.
    pub async fn register(&self, host: &str, port: u16, active: bool, user: &str) -> Result<Executor> {
        let executor = self.store.register_executor(host, port, active).await?;
        self.post_event(
            executor.id,
            ExecutorEventType::Created,
            user,
            &format!("Executor {} created", executor.address()),
        )
        .await?;
        if active {
            self.post_event(executor.id, ExecutorEventType::Activation, user, "activated on creation")
                .await?;
        }
        self.entries.insert(
            executor.id,
            Entry {
                executor: executor.clone(),
                load: Arc::new(AtomicUsize::new(0)),
                failures: Arc::new(AtomicU32::new(0)),
            },
        );
        info!(executor_id = executor.id, address = %executor.address(), active, "Executor registered");
        Ok(executor)
    }

    /// Change an executor's address and log it.
    pub async fn update_address(&self, executor_id: i64, host: &str, port: u16, user: &str) -> Result<()> {
        let previous = self
            .store
            .fetch_executor(executor_id)
            .await?
            .ok_or(Error::ExecutorNotFound(executor_id))?;
        if !self
            .store
            .update_executor_address(executor_id, host, port)
            .await?
        {
            return Err(Error::ExecutorNotFound(executor_id));
        }
        self.post_event(
            executor_id,
            ExecutorEventType::HostUpdate,
            user,
            &format!("{} -> {}:{}", previous.address(), host, port),
        )
        .await?;
        if let Some(mut entry) = self.entries.get_mut(&executor_id) {
            entry.executor.host = host.to_string();
            entry.executor.port = port;
        }
        Ok(())
    }

    /// Activate or deactivate an executor. Returns `true` if the flag changed.
    pub async fn set_active(
        &self,
        executor_id: i64,
        active: bool,
        user: &str,
        message: &str,
    ) -> Result<bool> {
        if self.store.fetch_executor(executor_id).await?.is_none() {
            return Err(Error::ExecutorNotFound(executor_id));
        }
        let changed = self.store.set_executor_active(executor_id, active).await?;
        if let Some(mut entry) = self.entries.get_mut(&executor_id) {
            entry.executor.active = active;
            if active {
                entry.failures.store(0, Ordering::SeqCst);
            }
        }
        if changed {
            let kind = if active {
                ExecutorEventType::Activation
            } else {
                ExecutorEventType::Inactivation
            };
            self.post_event(executor_id, kind, user, message).await?;
            info!(executor_id, active, user, "Executor active flag changed");
        }
        Ok(changed)
    }

    async fn post_event(
        &self,
        executor_id: i64,
        event_type: ExecutorEventType,
        user: &str,
        message: &str,
    ) -> Result<()> {
        self.store
            .post_executor_event(&ExecutorEvent {
                executor_id,
                event_type,
                event_time: Utc::now(),
                user: user.to_string(),
                message: message.to_string(),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::MemoryStore;

    async fn registry(capacity: usize) -> (Arc<MemoryStore>, ExecutorRegistry) {
        let store = Arc::new(MemoryStore::new());
        let registry = ExecutorRegistry::new(
            store.clone(),
            RegistryConfig {
                capacity,
                failure_threshold: 3,
            },
        );
        (store, registry)
    }

    #[tokio::test]
    async fn test_list_active_orders_by_load_then_id() {
        let (_store, registry) = registry(5).await;
        let a = registry.register("a", 1, true, "admin").await.unwrap();
        let b = registry.register("b", 2, true, "admin").await.unwrap();
        registry.register("c", 3, false, "admin").await.unwrap();

        let ids: Vec<i64> = registry.list_active().iter().map(|s| s.executor.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);

        assert!(registry.try_reserve(a.id));
        let ids: Vec<i64> = registry.list_active().iter().map(|s| s.executor.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }

    #[tokio::test]
    async fn test_reserve_respects_capacity_and_active_flag() {
        let (_store, registry) = registry(1).await;
        let a = registry.register("a", 1, true, "admin").await.unwrap();
        let off = registry.register("b", 2, false, "admin").await.unwrap();

        assert!(registry.try_reserve(a.id));
        assert!(!registry.try_reserve(a.id));
        assert!(!registry.try_reserve(off.id));

        registry.release(a.id);
        registry.release(a.id);
        assert_eq!(registry.load(a.id), 0);
        assert!(registry.try_reserve(a.id));
    }

    #[tokio::test]
    async fn test_ping_failures_deactivate_at_threshold() {
        let (store, registry) = registry(1).await;
        let a = registry.register("a", 1, true, "admin").await.unwrap();

        assert!(!registry.record_ping_failure(a.id).await.unwrap());
        assert!(!registry.record_ping_failure(a.id).await.unwrap());
        assert!(registry.record_ping_failure(a.id).await.unwrap());
        assert!(!registry.is_active(a.id));
        assert!(!store.fetch_executor(a.id).await.unwrap().unwrap().active);

        let events = store.executor_events(a.id, 10, 0).await.unwrap();
        let kinds: Vec<ExecutorEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                ExecutorEventType::Created,
                ExecutorEventType::Activation,
                ExecutorEventType::Inactivation
            ]
        );
        assert_eq!(events[2].user, SYSTEM_USER);
    }

    #[tokio::test]
    async fn test_ping_success_resets_failures() {
        let (_store, registry) = registry(1).await;
        let a = registry.register("a", 1, true, "admin").await.unwrap();

        registry.record_ping_failure(a.id).await.unwrap();
        registry.record_ping_failure(a.id).await.unwrap();
        registry.record_ping_success(a.id).await.unwrap();
        assert!(!registry.record_ping_failure(a.id).await.unwrap());
        assert!(registry.is_active(a.id));
        assert!(registry.get(a.id).unwrap().last_seen.is_some());
    }

    #[tokio::test]
    async fn test_refresh_picks_up_store_changes() {
        let (store, registry) = registry(2).await;
        let a = store.register_executor("a", 1, false).await.unwrap();
        registry.refresh().await.unwrap();
        assert!(registry.list_active().is_empty());

        store.set_executor_active(a.id, true).await.unwrap();
        registry.refresh().await.unwrap();
        assert_eq!(registry.list_active().len(), 1);

        registry.rebuild_loads(&HashMap::from([(a.id, 2)]));
        assert!(!registry.try_reserve(a.id));
    }

    #[tokio::test]
    async fn test_update_address_logs_host_update() {
        let (store, registry) = registry(2).await;
        let a = registry.register("a", 1, false, "admin").await.unwrap();
        registry.update_address(a.id, "a2", 2, "admin").await.unwrap();

        assert_eq!(registry.get(a.id).unwrap().address(), "a2:2");
        let events = store.executor_events(a.id, 10, 0).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, ExecutorEventType::HostUpdate);
        assert!(registry.update_address(99, "x", 1, "admin").await.is_err());
    }
}
