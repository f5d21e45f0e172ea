// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowgate Executor - HTTP server
//!
//! Registers the built-in job runners and serves the executor API until
//! ctrl-c, then kills the flows still running.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use flowgate_executor::config::Config;
use flowgate_executor::flow_runner::{FlowRunner, FlowRunnerConfig};
use flowgate_executor::jobs::{CommandRunner, JobRunnerRegistry, NoopRunner};
use flowgate_executor::reporter::HttpReporter;
use flowgate_executor::server::{AppState, run_http_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowgate_executor=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        work_dir = %config.work_dir.display(),
        max_flows = config.max_flows,
        "Starting Flowgate Executor"
    );

    tokio::fs::create_dir_all(&config.work_dir).await?;

    let jobs = JobRunnerRegistry::new()
        .register(Arc::new(CommandRunner::new(&config.work_dir, config.job_timeout)))
        .register(Arc::new(NoopRunner::new()));
    let reporter = HttpReporter::new(config.callback_timeout, config.callback_retries)?;
    let runner = Arc::new(FlowRunner::new(
        Arc::new(jobs),
        Arc::new(reporter),
        FlowRunnerConfig {
            max_flows: config.max_flows,
            finished_retention: config.finished_retention,
        },
    ));

    let listener = TcpListener::bind(config.http_addr).await?;
    let state = AppState {
        runner: runner.clone(),
    };
    run_http_server(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
        }
        info!("Shutdown signal received");
    })
    .await?;

    // Stop what is still running; the dispatcher fails these flows over
    runner.shutdown();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while runner.running_flows() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!(
        remaining = runner.running_flows(),
        "Flowgate Executor shut down"
    );

    Ok(())
}
