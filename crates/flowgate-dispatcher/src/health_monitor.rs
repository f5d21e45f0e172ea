// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that keeps the executor registry fresh.
//!
//! Two timers share one loop: the registry is re-read from the store on the
//! refresh interval, and active executors are pinged on the health-check
//! interval. Each ping is bounded by the executor timeout. A ping that fails,
//! times out, or reports anything other than alive counts as a failure; the
//! registry deactivates the executor once the failure threshold is reached.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::executor_client::{ExecutorClient, with_timeout};
use crate::registry::ExecutorRegistry;

/// Configuration for the health monitor.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// How often the registry is re-read from the store.
    pub refresh_interval: Duration,
    /// How often active executors are pinged.
    pub ping_interval: Duration,
    /// Bound on a single ping.
    pub ping_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5),
            ping_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of one round of pings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingRound {
    /// Executors that answered alive.
    pub healthy: usize,
    /// Executors that failed the check.
    pub failed: usize,
    /// Executors deactivated in this round.
    pub deactivated: Vec<i64>,
}

/// Pings executors and refreshes the registry.
pub struct HealthMonitor {
    registry: Arc<ExecutorRegistry>,
    client: Arc<dyn ExecutorClient>,
    config: HealthMonitorConfig,
    shutdown: Arc<Notify>,
}

impl HealthMonitor {
    /// Create a new health monitor.
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        client: Arc<dyn ExecutorClient>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            registry,
            client,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Ping every active executor once.
    pub async fn ping_all(&self) -> PingRound {
        let executors = self.registry.list_active();
        let results = join_all(executors.iter().map(|snapshot| {
            let executor = &snapshot.executor;
            async move {
                let result = with_timeout(
                    executor,
                    self.config.ping_timeout,
                    self.client.ping(executor),
                )
                .await;
                (executor, result)
            }
        }))
        .await;

        let mut round = PingRound::default();
        for (executor, result) in results {
            let alive = match result {
                Ok(health) if health.is_alive() => true,
                Ok(health) => {
                    warn!(executor = %executor.address(), status = %health.status, "Executor reported unhealthy");
                    false
                }
                Err(e) => {
                    warn!(executor = %executor.address(), error = %e, "Health check failed");
                    false
                }
            };

            if alive {
                round.healthy += 1;
                if let Err(e) = self.registry.record_ping_success(executor.id).await {
                    error!(executor_id = executor.id, error = %e, "Failed to record health check");
                }
                continue;
            }

            round.failed += 1;
            match self.registry.record_ping_failure(executor.id).await {
                Ok(true) => round.deactivated.push(executor.id),
                Ok(false) => {}
                Err(e) => {
                    error!(executor_id = executor.id, error = %e, "Failed to record health check failure")
                }
            }
        }
        round
    }

    /// Run the monitor loop until shutdown.
    pub async fn run(&self) {
        info!(
            refresh_interval_secs = self.config.refresh_interval.as_secs(),
            ping_interval_secs = self.config.ping_interval.as_secs(),
            "Health monitor started"
        );

        let mut refresh = tokio::time::interval(self.config.refresh_interval);
        let mut ping = tokio::time::interval(self.config.ping_interval);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Health monitor received shutdown signal");
                    break;
                }

                _ = refresh.tick() => {
                    if let Err(e) = self.registry.refresh().await {
                        error!(error = %e, "Failed to refresh executor registry");
                    }
                }

                _ = ping.tick() => {
                    let round = self.ping_all().await;
                    debug!(healthy = round.healthy, failed = round.failed, "Health check round");
                }
            }
        }

        info!("Health monitor stopped");
    }
}
