// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowgate Executor - runs flow DAGs handed over by the dispatcher
//!
//! An executor node accepts flow snapshots over HTTP, drives each one through
//! the flow state machine, runs its nodes through job runners selected by
//! `job_type`, and pushes every node status change back to the dispatcher.
//!
//! ```text
//! dispatcher ──submit/status/cancel/ping──▶ server ──▶ FlowRunner
//!     ▲                                                   │
//!     └──────────── POST /api/v1/callbacks/{id} ◀── Reporter
//!                                                         │
//!                                    JobRunnerRegistry ◀──┘
//!                                    (command, noop)
//! ```
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `FLOWGATE_EXECUTOR_PORT` | No | `8091` | HTTP API port |
//! | `FLOWGATE_EXECUTOR_WORK_DIR` | No | `.data/jobs` | Job output files |
//! | `FLOWGATE_EXECUTOR_MAX_FLOWS` | No | `30` | Concurrent flows |
//! | `FLOWGATE_JOB_TIMEOUT_SECS` | No | `3600` | Command job timeout |

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for executor operations.
pub mod error;

/// Job runners by job type.
pub mod jobs;

/// Per-flow drivers.
pub mod flow_runner;

/// Node event delivery to the dispatcher.
pub mod reporter;

/// HTTP API.
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
pub use flow_runner::{FlowRunner, FlowRunnerConfig};
