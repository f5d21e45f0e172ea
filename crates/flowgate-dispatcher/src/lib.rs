// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowgate Dispatcher - Execution Dispatch & Reconciliation Engine
//!
//! The dispatcher owns the lifecycle of flow executions from submission to a
//! terminal status. Flows are DAGs of jobs; the dispatcher hands each flow to
//! exactly one remote executor, tracks node progress reported back by that
//! executor, and repairs its own state after crashes or executor failures.
//!
//! # Architecture
//!
//! ```text
//!            HTTP API (server)                      executors
//!     submit / kill / callbacks / executors      ┌────────────────┐
//!                    │                           │ /api/v1/...    │
//!                    ▼                           └───────▲────────┘
//!          ┌──────────────────┐   enqueue   ┌──────────┐ │ submit/cancel
//!          │ ExecutionManager │────────────▶│ Scheduler│─┤ status/ping
//!          └────────┬─────────┘             └────┬─────┘ │
//!                   │ node events                │       │
//!                   ▼                            ▼       │
//!          ┌──────────────────┐          ┌─────────────┐ │
//!          │ ExecutionTracker │◀─────────│ Reconciler  │─┤
//!          └────────┬─────────┘          └─────────────┘ │
//!                   │ finished                   ┌───────┴───────┐
//!                   ▼                            │ HealthMonitor │
//!          ┌──────────────────┐                  └───────────────┘
//!          │    Finalizer     │──▶ Notifier
//!          └────────┬─────────┘
//!                   ▼
//!          Execution Record Store (SQLite)
//! ```
//!
//! The store is the source of truth. Every coordination step is a
//! conditional update, so several dispatchers may share one store.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `FLOWGATE_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `FLOWGATE_HTTP_PORT` | No | `8090` | HTTP API port |
//! | `FLOWGATE_CALLBACK_URL` | No | `http://127.0.0.1:<port>` | Base URL for node events |
//! | `FLOWGATE_EXECUTOR_TIMEOUT_SECS` | No | `30` | Bound on executor calls |
//! | `FLOWGATE_PING_FAILURE_THRESHOLD` | No | `3` | Failed pings before deactivation |
//! | `FLOWGATE_DISPATCH_RETRY_CEILING` | No | `3` | Failed dispatches before FAILED |
//! | `FLOWGATE_FAILOVER_GRACE_SECS` | No | `60` | Inactive executor grace period |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | No | - | Enables OTLP export of dispatch metrics |
//!
//! See [`config::Config::from_env`] for the full list.

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for dispatcher operations.
pub mod error;

/// Request/response client for remote executors.
pub mod executor_client;

/// In-memory view of executors with load and health counters.
pub mod registry;

/// Background worker that pings executors.
pub mod health_monitor;

/// Ordered queue of executions waiting for an executor.
pub mod queue;

/// Binds queued executions to executors.
pub mod scheduler;

/// In-flight executions and their flow state machines.
pub mod tracker;

/// Background worker that repairs dispatcher state.
pub mod reconciler;

/// Terminal transitions.
pub mod finalizer;

/// OpenTelemetry dispatch metrics.
pub mod metrics;

/// Success and failure notifications.
pub mod notifier;

/// Dependency-check plugins.
pub mod dependency;

/// Submission, kill, and node-event handling.
pub mod manager;

/// HTTP API.
pub mod server;

/// Component wiring and background task lifecycle.
pub mod runtime;

pub use config::Config;
pub use error::{Error, Result};
pub use manager::{ExecutionManager, KillOutcome};
pub use runtime::{Dispatcher, DispatcherRuntime, DispatcherRuntimeBuilder};
