// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// HTTP API address
    pub http_addr: SocketAddr,
    /// Base URL executors use to post node events back
    pub callback_base_url: String,
    /// How often the scheduler drains the dispatch queue
    pub dispatch_interval: Duration,
    /// How often the reconciliation loop runs
    pub reconcile_interval: Duration,
    /// How often the executor registry is re-read from the store
    pub registry_refresh_interval: Duration,
    /// How often active executors are pinged
    pub health_check_interval: Duration,
    /// Upper bound for any single call to an executor
    pub executor_timeout: Duration,
    /// Consecutive failed pings before an executor is deactivated
    pub ping_failure_threshold: u32,
    /// Failed dispatch attempts before an execution is failed
    pub dispatch_retry_ceiling: u32,
    /// How long an executor may be inactive before its flows fail over
    pub failover_grace: Duration,
    /// How long an execution may sit assigned but not started before rollback
    pub stale_dispatch_grace: Duration,
    /// Maximum concurrent flows per executor
    pub executor_capacity: usize,
    /// First delay after a failed status poll
    pub status_backoff_base: Duration,
    /// Longest delay between failed status polls
    pub status_backoff_max: Duration,
    /// Message bus dependency-check settings, when enabled
    pub message_bus: Option<BTreeMap<String, String>>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FLOWGATE_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `FLOWGATE_HTTP_PORT`: HTTP API port (default: 8090)
    /// - `FLOWGATE_CALLBACK_URL`: callback base URL (default: `http://127.0.0.1:<port>`)
    /// - `FLOWGATE_DISPATCH_INTERVAL_MS` (default: 1000)
    /// - `FLOWGATE_RECONCILE_INTERVAL_SECS` (default: 10)
    /// - `FLOWGATE_REGISTRY_REFRESH_SECS` (default: 5)
    /// - `FLOWGATE_HEALTH_CHECK_INTERVAL_SECS` (default: 10)
    /// - `FLOWGATE_EXECUTOR_TIMEOUT_SECS` (default: 30)
    /// - `FLOWGATE_PING_FAILURE_THRESHOLD` (default: 3)
    /// - `FLOWGATE_DISPATCH_RETRY_CEILING` (default: 3)
    /// - `FLOWGATE_FAILOVER_GRACE_SECS` (default: 60)
    /// - `FLOWGATE_STALE_DISPATCH_GRACE_SECS` (default: 120)
    /// - `FLOWGATE_EXECUTOR_CAPACITY` (default: 30)
    /// - `FLOWGATE_STATUS_BACKOFF_BASE_SECS` (default: 10)
    /// - `FLOWGATE_STATUS_BACKOFF_MAX_SECS` (default: 300)
    /// - `FLOWGATE_MESSAGE_BUS_BROKER_URL` and `FLOWGATE_MESSAGE_BUS_SCHEMA_REGISTRY_URL`:
    ///   enable the message bus dependency check
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("FLOWGATE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("FLOWGATE_DATABASE_URL"))?;

        let http_port: u16 = parse_var(
            "FLOWGATE_HTTP_PORT",
            8090,
            "must be a valid port number",
        )?;
        let callback_base_url = std::env::var("FLOWGATE_CALLBACK_URL")
            .unwrap_or_else(|_| format!("http://127.0.0.1:{}", http_port));

        let message_bus = match std::env::var("FLOWGATE_MESSAGE_BUS_BROKER_URL") {
            Ok(broker) => {
                let schema_registry = std::env::var("FLOWGATE_MESSAGE_BUS_SCHEMA_REGISTRY_URL")
                    .map_err(|_| ConfigError::Missing("FLOWGATE_MESSAGE_BUS_SCHEMA_REGISTRY_URL"))?;
                Some(BTreeMap::from([
                    ("broker.url".to_string(), broker),
                    ("schema.registry.url".to_string(), schema_registry),
                ]))
            }
            Err(_) => None,
        };

        Ok(Self {
            database_url,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            callback_base_url,
            dispatch_interval: Duration::from_millis(parse_var(
                "FLOWGATE_DISPATCH_INTERVAL_MS",
                1000,
                "must be a number of milliseconds",
            )?),
            reconcile_interval: secs("FLOWGATE_RECONCILE_INTERVAL_SECS", 10)?,
            registry_refresh_interval: secs("FLOWGATE_REGISTRY_REFRESH_SECS", 5)?,
            health_check_interval: secs("FLOWGATE_HEALTH_CHECK_INTERVAL_SECS", 10)?,
            executor_timeout: secs("FLOWGATE_EXECUTOR_TIMEOUT_SECS", 30)?,
            ping_failure_threshold: parse_var(
                "FLOWGATE_PING_FAILURE_THRESHOLD",
                3,
                "must be a positive integer",
            )?,
            dispatch_retry_ceiling: parse_var(
                "FLOWGATE_DISPATCH_RETRY_CEILING",
                3,
                "must be a positive integer",
            )?,
            failover_grace: secs("FLOWGATE_FAILOVER_GRACE_SECS", 60)?,
            stale_dispatch_grace: secs("FLOWGATE_STALE_DISPATCH_GRACE_SECS", 120)?,
            executor_capacity: parse_var(
                "FLOWGATE_EXECUTOR_CAPACITY",
                30,
                "must be a positive integer",
            )?,
            status_backoff_base: secs("FLOWGATE_STATUS_BACKOFF_BASE_SECS", 10)?,
            status_backoff_max: secs("FLOWGATE_STATUS_BACKOFF_MAX_SECS", 300)?,
            message_bus,
        })
    }
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: T,
    hint: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key, hint)),
        Err(_) => Ok(default),
    }
}

fn secs(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_var(key, default, "must be a number of seconds").map(Duration::from_secs)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
