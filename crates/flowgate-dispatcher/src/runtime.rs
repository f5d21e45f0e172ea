// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatcher runtime.
//!
//! Wires the registry, queue, scheduler, reconciler, health monitor and HTTP
//! API together and runs them as background tasks.
//!
//! # Example
//!
//! ```ignore
//! use flowgate_dispatcher::runtime::DispatcherRuntime;
//!
//! let runtime = DispatcherRuntime::builder()
//!     .store(store)
//!     .client(client)
//!     .bind_addr("0.0.0.0:8090".parse()?)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! // ... later
//! runtime.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use flowgate_core::ExecutionStore;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::dependency::{DependencyRegistry, MessageBus};
use crate::executor_client::ExecutorClient;
use crate::finalizer::Finalizer;
use crate::health_monitor::{HealthMonitor, HealthMonitorConfig};
use crate::manager::ExecutionManager;
use crate::metrics::DispatchMetrics;
use crate::notifier::{LoggingMailer, MailCreatorRegistry, Mailer, Notifier};
use crate::queue::{DispatchQueue, FifoPolicy, PriorityPolicy};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::registry::{ExecutorRegistry, RegistryConfig};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::server::{AppState, run_http_server};
use crate::tracker::ExecutionTracker;

/// Builder for [`DispatcherRuntime`].
pub struct DispatcherRuntimeBuilder {
    store: Option<Arc<dyn ExecutionStore>>,
    client: Option<Arc<dyn ExecutorClient>>,
    mailer: Arc<dyn Mailer>,
    mail_creators: MailCreatorRegistry,
    dependencies: DependencyRegistry,
    bus: MessageBus,
    priority_policy: Box<dyn PriorityPolicy>,
    bind_addr: Option<SocketAddr>,
    registry: RegistryConfig,
    scheduler: SchedulerConfig,
    reconciler: ReconcilerConfig,
    health: HealthMonitorConfig,
    metrics: Option<Arc<DispatchMetrics>>,
}

impl Default for DispatcherRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            client: None,
            mailer: Arc::new(LoggingMailer),
            mail_creators: MailCreatorRegistry::default(),
            dependencies: DependencyRegistry::default(),
            bus: MessageBus::default(),
            priority_policy: Box::new(FifoPolicy),
            bind_addr: None,
            registry: RegistryConfig::default(),
            scheduler: SchedulerConfig::default(),
            reconciler: ReconcilerConfig::default(),
            health: HealthMonitorConfig::default(),
            metrics: None,
        }
    }
}

impl DispatcherRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the execution record store (required).
    pub fn store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the executor client (required).
    pub fn client(mut self, client: Arc<dyn ExecutorClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the mail transport.
    ///
    /// Default: [`LoggingMailer`]
    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    /// Set the mail creators available to executions.
    pub fn mail_creators(mut self, creators: MailCreatorRegistry) -> Self {
        self.mail_creators = creators;
        self
    }

    /// Set the dependency-check registry.
    pub fn dependencies(mut self, dependencies: DependencyRegistry) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Set the in-process message bus exposed over HTTP.
    pub fn message_bus(mut self, bus: MessageBus) -> Self {
        self.bus = bus;
        self
    }

    /// Set the dispatch metrics instruments.
    ///
    /// Default: instruments on the global meter provider
    pub fn metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set the dispatch ordering.
    ///
    /// Default: [`FifoPolicy`]
    pub fn priority_policy(mut self, policy: Box<dyn PriorityPolicy>) -> Self {
        self.priority_policy = policy;
        self
    }

    /// Serve the HTTP API on this address. No server is started without one.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Base URL executors post node events to.
    pub fn callback_base_url(mut self, url: impl Into<String>) -> Self {
        self.scheduler.callback_base_url = Some(url.into());
        self
    }

    /// Maximum concurrent flows per executor.
    ///
    /// Default: 30
    pub fn executor_capacity(mut self, capacity: usize) -> Self {
        self.registry.capacity = capacity;
        self
    }

    /// Consecutive failed pings before an executor is deactivated.
    ///
    /// Default: 3
    pub fn ping_failure_threshold(mut self, threshold: u32) -> Self {
        self.registry.failure_threshold = threshold;
        self
    }

    /// Failed dispatch attempts before an execution is failed.
    ///
    /// Default: 3
    pub fn dispatch_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.scheduler.retry_ceiling = ceiling;
        self
    }

    /// Upper bound for any single executor call.
    ///
    /// Default: 30 seconds
    pub fn executor_timeout(mut self, timeout: Duration) -> Self {
        self.scheduler.executor_timeout = timeout;
        self.reconciler.executor_timeout = timeout;
        self.health.ping_timeout = timeout;
        self
    }

    /// Idle interval of the dispatch loop.
    ///
    /// Default: 1 second
    pub fn dispatch_interval(mut self, interval: Duration) -> Self {
        self.scheduler.poll_interval = interval;
        self
    }

    /// Interval between reconciliation cycles.
    ///
    /// Default: 10 seconds
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconciler.poll_interval = interval;
        self
    }

    /// Interval between registry refreshes.
    ///
    /// Default: 5 seconds
    pub fn registry_refresh_interval(mut self, interval: Duration) -> Self {
        self.health.refresh_interval = interval;
        self
    }

    /// Interval between health-check rounds.
    ///
    /// Default: 10 seconds
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health.ping_interval = interval;
        self
    }

    /// How long an executor may stay inactive before its flows fail over.
    ///
    /// Default: 60 seconds
    pub fn failover_grace(mut self, grace: Duration) -> Self {
        self.reconciler.failover_grace = grace;
        self
    }

    /// How long an execution may stay half-dispatched before rollback.
    ///
    /// Default: 120 seconds
    pub fn stale_dispatch_grace(mut self, grace: Duration) -> Self {
        self.reconciler.stale_dispatch_grace = grace;
        self
    }

    /// Backoff applied to status polls of an unresponsive executor.
    ///
    /// Default: 10 seconds doubling up to 300 seconds
    pub fn status_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.reconciler.status_backoff_base = base;
        self.reconciler.status_backoff_max = max;
        self
    }

    /// Apply every tunable from an environment [`Config`].
    pub fn config(self, config: &Config) -> Self {
        self.bind_addr(config.http_addr)
            .callback_base_url(config.callback_base_url.clone())
            .executor_capacity(config.executor_capacity)
            .ping_failure_threshold(config.ping_failure_threshold)
            .dispatch_retry_ceiling(config.dispatch_retry_ceiling)
            .executor_timeout(config.executor_timeout)
            .dispatch_interval(config.dispatch_interval)
            .reconcile_interval(config.reconcile_interval)
            .registry_refresh_interval(config.registry_refresh_interval)
            .health_check_interval(config.health_check_interval)
            .failover_grace(config.failover_grace)
            .stale_dispatch_grace(config.stale_dispatch_grace)
            .status_backoff(config.status_backoff_base, config.status_backoff_max)
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<DispatcherRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let client = self
            .client
            .ok_or_else(|| anyhow::anyhow!("client is required"))?;
        if self.registry.capacity == 0 {
            return Err(anyhow::anyhow!("executor capacity must be positive"));
        }

        Ok(DispatcherRuntimeConfig {
            store,
            client,
            mailer: self.mailer,
            mail_creators: self.mail_creators,
            dependencies: self.dependencies,
            bus: self.bus,
            priority_policy: self.priority_policy,
            bind_addr: self.bind_addr,
            registry: self.registry,
            scheduler: self.scheduler,
            reconciler: self.reconciler,
            health: self.health,
            metrics: self.metrics,
        })
    }
}

/// Validated runtime configuration.
pub struct DispatcherRuntimeConfig {
    store: Arc<dyn ExecutionStore>,
    client: Arc<dyn ExecutorClient>,
    mailer: Arc<dyn Mailer>,
    mail_creators: MailCreatorRegistry,
    dependencies: DependencyRegistry,
    bus: MessageBus,
    priority_policy: Box<dyn PriorityPolicy>,
    bind_addr: Option<SocketAddr>,
    registry: RegistryConfig,
    scheduler: SchedulerConfig,
    reconciler: ReconcilerConfig,
    health: HealthMonitorConfig,
    metrics: Option<Arc<DispatchMetrics>>,
}

/// Every dispatcher component, wired over one store.
///
/// Nothing runs until the workers are spawned; tests drive the components
/// directly.
pub struct Dispatcher {
    /// Execution record store.
    pub store: Arc<dyn ExecutionStore>,
    /// Executor registry.
    pub registry: Arc<ExecutorRegistry>,
    /// Dispatch queue.
    pub queue: Arc<DispatchQueue>,
    /// In-flight executions.
    pub tracker: Arc<ExecutionTracker>,
    /// Notification dispatcher.
    pub notifier: Arc<Notifier>,
    /// Terminal transitions.
    pub finalizer: Arc<Finalizer>,
    /// Dispatch loop.
    pub scheduler: Arc<Scheduler>,
    /// Reconciliation loop.
    pub reconciler: Arc<Reconciler>,
    /// Dispatch metrics.
    pub metrics: Arc<DispatchMetrics>,
    /// Health monitor.
    pub health_monitor: Arc<HealthMonitor>,
    /// Execution and executor operations.
    pub manager: Arc<ExecutionManager>,
    /// Dependency-check plugins.
    pub dependencies: Arc<DependencyRegistry>,
    /// In-process message bus.
    pub bus: MessageBus,
}

impl Dispatcher {
    /// Handler state for the HTTP API.
    pub fn app_state(&self) -> AppState {
        AppState {
            manager: self.manager.clone(),
            dependencies: self.dependencies.clone(),
            bus: self.bus.clone(),
        }
    }
}

impl DispatcherRuntimeConfig {
    /// Wire the components without starting anything.
    pub fn assemble(self) -> (Dispatcher, Option<SocketAddr>) {
        let store = self.store;
        let client = self.client;

        let registry = Arc::new(ExecutorRegistry::new(store.clone(), self.registry));
        let queue = Arc::new(DispatchQueue::new(self.priority_policy));
        let tracker = Arc::new(ExecutionTracker::new());
        let notifier = Arc::new(Notifier::new(self.mail_creators, self.mailer));
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(DispatchMetrics::global()));
        let finalizer = Arc::new(
            Finalizer::new(
                store.clone(),
                registry.clone(),
                queue.clone(),
                tracker.clone(),
                notifier.clone(),
            )
            .with_metrics(metrics.clone()),
        );
        let executor_timeout = self.scheduler.executor_timeout;
        let scheduler = Arc::new(
            Scheduler::new(
                store.clone(),
                registry.clone(),
                queue.clone(),
                tracker.clone(),
                client.clone(),
                finalizer.clone(),
                self.scheduler,
            )
            .with_metrics(metrics.clone()),
        );
        let reconciler = Arc::new(
            Reconciler::new(
                store.clone(),
                registry.clone(),
                queue.clone(),
                tracker.clone(),
                client.clone(),
                finalizer.clone(),
                self.reconciler,
            )
            .with_metrics(metrics.clone()),
        );
        let health_monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            client.clone(),
            self.health,
        ));
        let manager = Arc::new(ExecutionManager::new(
            store.clone(),
            registry.clone(),
            queue.clone(),
            tracker.clone(),
            scheduler.clone(),
            finalizer.clone(),
            notifier.clone(),
            client,
            executor_timeout,
        ));

        let dispatcher = Dispatcher {
            store,
            registry,
            queue,
            tracker,
            notifier,
            finalizer,
            scheduler,
            reconciler,
            metrics,
            health_monitor,
            manager,
            dependencies: Arc::new(self.dependencies),
            bus: self.bus,
        };
        (dispatcher, self.bind_addr)
    }

    /// Start the runtime.
    ///
    /// Loads the registry, runs one reconciliation cycle so the queue and
    /// tracker reflect the store, then spawns the background workers and the
    /// HTTP server.
    pub async fn start(self) -> Result<DispatcherRuntime> {
        let (dispatcher, bind_addr) = self.assemble();
        let dispatcher = Arc::new(dispatcher);

        dispatcher.registry.refresh().await?;
        match dispatcher.reconciler.run_once().await {
            Ok(report) => info!(
                restored = report.restored,
                rehydrated = report.rehydrated,
                requeued = report.requeued,
                "Startup reconciliation complete"
            ),
            Err(e) => warn!(error = %e, "Startup reconciliation failed"),
        }

        let scheduler_shutdown = dispatcher.scheduler.shutdown_handle();
        let scheduler_handle = tokio::spawn({
            let scheduler = dispatcher.scheduler.clone();
            async move {
                scheduler.run().await;
            }
        });

        let reconciler_shutdown = dispatcher.reconciler.shutdown_handle();
        let reconciler_handle = tokio::spawn({
            let reconciler = dispatcher.reconciler.clone();
            async move {
                reconciler.run().await;
            }
        });

        let health_shutdown = dispatcher.health_monitor.shutdown_handle();
        let health_handle = tokio::spawn({
            let monitor = dispatcher.health_monitor.clone();
            async move {
                monitor.run().await;
            }
        });

        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let (server_handle, local_addr) = match bind_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                let local_addr = listener.local_addr()?;
                let state = dispatcher.app_state();
                let handle = tokio::spawn(async move {
                    run_http_server(listener, state, server_shutdown_rx).await
                });
                (Some(handle), Some(local_addr))
            }
            None => (None, None),
        };

        info!(addr = ?local_addr, "Dispatcher runtime started");

        Ok(DispatcherRuntime {
            dispatcher,
            local_addr,
            scheduler_handle,
            scheduler_shutdown,
            reconciler_handle,
            reconciler_shutdown,
            health_handle,
            health_shutdown,
            server_handle,
            server_shutdown_tx,
        })
    }
}

/// A running dispatcher.
pub struct DispatcherRuntime {
    dispatcher: Arc<Dispatcher>,
    local_addr: Option<SocketAddr>,
    scheduler_handle: JoinHandle<()>,
    scheduler_shutdown: Arc<Notify>,
    reconciler_handle: JoinHandle<()>,
    reconciler_shutdown: Arc<Notify>,
    health_handle: JoinHandle<()>,
    health_shutdown: Arc<Notify>,
    server_handle: Option<JoinHandle<Result<()>>>,
    server_shutdown_tx: watch::Sender<bool>,
}

impl DispatcherRuntime {
    /// Create a new builder.
    pub fn builder() -> DispatcherRuntimeBuilder {
        DispatcherRuntimeBuilder::new()
    }

    /// Address the HTTP API is bound to, if it is served.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The wired components.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Execution and executor operations.
    pub fn manager(&self) -> &Arc<ExecutionManager> {
        &self.dispatcher.manager
    }

    /// Check whether every background task is still running.
    pub fn is_running(&self) -> bool {
        !self.scheduler_handle.is_finished()
            && !self.reconciler_handle.is_finished()
            && !self.health_handle.is_finished()
            && self
                .server_handle
                .as_ref()
                .is_none_or(|handle| !handle.is_finished())
    }

    /// Stop every background task and wait for it to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down dispatcher runtime");

        let _ = self.server_shutdown_tx.send(true);
        self.scheduler_shutdown.notify_one();
        self.reconciler_shutdown.notify_one();
        self.health_shutdown.notify_one();

        if let Err(e) = self.scheduler_handle.await {
            error!("Scheduler task panicked: {}", e);
        }
        if let Err(e) = self.reconciler_handle.await {
            error!("Reconciler task panicked: {}", e);
        }
        if let Err(e) = self.health_handle.await {
            error!("Health monitor task panicked: {}", e);
        }

        self.dispatcher.dependencies.shutdown().await;

        if let Some(handle) = self.server_handle {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("HTTP server error: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("HTTP server task panicked: {}", e);
                    return Err(anyhow::anyhow!("server task panicked: {}", e));
                }
            }
        }

        info!("Dispatcher runtime stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor_client::MockExecutorClient;
    use flowgate_core::{DagNode, ExecutionOptions, MemoryStore, Status};

    #[test]
    fn test_build_requires_store_and_client() {
        let err = DispatcherRuntime::builder()
            .client(Arc::new(MockExecutorClient::new()))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("store is required"));

        let err = DispatcherRuntime::builder()
            .store(Arc::new(MemoryStore::new()))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("client is required"));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let result = DispatcherRuntime::builder()
            .store(Arc::new(MemoryStore::new()))
            .client(Arc::new(MockExecutorClient::new()))
            .executor_capacity(0)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_runtime_dispatches_and_shuts_down() {
        let client = MockExecutorClient::new();
        let runtime = DispatcherRuntime::builder()
            .store(Arc::new(MemoryStore::new()))
            .client(Arc::new(client.clone()))
            .dispatch_interval(Duration::from_millis(20))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        assert!(runtime.is_running());
        assert!(runtime.local_addr().is_none());

        let manager = runtime.manager().clone();
        manager
            .register_executor("node-1", 7001, true, "admin")
            .await
            .unwrap();
        let execution = manager
            .submit(
                "nightly",
                vec![DagNode::new("a", &[])],
                ExecutionOptions::default(),
            )
            .await
            .unwrap();

        let mut status = execution.status;
        for _ in 0..100 {
            status = manager.get(execution.id).await.unwrap().status;
            if status == Status::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, Status::Running);
        assert_eq!(client.submissions().await.len(), 1);

        runtime.shutdown().await.unwrap();
    }
}
