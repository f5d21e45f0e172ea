// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Executor node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP API address
    pub http_addr: SocketAddr,
    /// Directory for job working files
    pub work_dir: PathBuf,
    /// Maximum concurrent flows accepted
    pub max_flows: usize,
    /// Upper bound for a single command job
    pub job_timeout: Duration,
    /// How long finished flows stay queryable
    pub finished_retention: Duration,
    /// Timeout for one callback request
    pub callback_timeout: Duration,
    /// Extra attempts for a failed callback
    pub callback_retries: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `FLOWGATE_EXECUTOR_PORT`: HTTP API port (default: 8091)
    /// - `FLOWGATE_EXECUTOR_WORK_DIR`: job working directory (default: `.data/jobs`)
    /// - `FLOWGATE_EXECUTOR_MAX_FLOWS` (default: 30)
    /// - `FLOWGATE_JOB_TIMEOUT_SECS` (default: 3600)
    /// - `FLOWGATE_FINISHED_RETENTION_SECS` (default: 3600)
    /// - `FLOWGATE_CALLBACK_TIMEOUT_SECS` (default: 10)
    /// - `FLOWGATE_CALLBACK_RETRIES` (default: 3)
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = parse_var("FLOWGATE_EXECUTOR_PORT", 8091, "must be a valid port number")?;
        let work_dir = std::env::var("FLOWGATE_EXECUTOR_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".data/jobs"));

        let max_flows: usize = parse_var(
            "FLOWGATE_EXECUTOR_MAX_FLOWS",
            30,
            "must be a positive integer",
        )?;
        if max_flows == 0 {
            return Err(ConfigError::Invalid(
                "FLOWGATE_EXECUTOR_MAX_FLOWS",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            work_dir,
            max_flows,
            job_timeout: secs("FLOWGATE_JOB_TIMEOUT_SECS", 3600)?,
            finished_retention: secs("FLOWGATE_FINISHED_RETENTION_SECS", 3600)?,
            callback_timeout: secs("FLOWGATE_CALLBACK_TIMEOUT_SECS", 10)?,
            callback_retries: parse_var(
                "FLOWGATE_CALLBACK_RETRIES",
                3,
                "must be a non-negative integer",
            )?,
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
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
