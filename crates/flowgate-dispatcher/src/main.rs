// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowgate Dispatcher - HTTP server
//!
//! Loads configuration from the environment, connects the SQLite store, and
//! runs the scheduler, reconciler, health monitor and HTTP API until ctrl-c.

use std::sync::Arc;
use tracing::{info, warn};

use flowgate_core::SqliteStore;
use flowgate_dispatcher::config::Config;
use flowgate_dispatcher::dependency::{DependencyRegistry, MessageBus, MessageBusCheck};
use flowgate_dispatcher::executor_client::{HttpClientConfig, HttpExecutorClient};
use flowgate_dispatcher::metrics;
use flowgate_dispatcher::runtime::DispatcherRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowgate_dispatcher=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    let meter_provider = metrics::init_otlp();

    info!(
        http_addr = %config.http_addr,
        callback_url = %config.callback_base_url,
        "Starting Flowgate Dispatcher"
    );

    // Connect and migrate the store
    let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
    info!("Connected to database");

    let client = Arc::new(HttpExecutorClient::new(HttpClientConfig {
        request_timeout: config.executor_timeout,
        ..HttpClientConfig::default()
    })?);

    let bus = MessageBus::default();
    let mut dependencies = DependencyRegistry::builder();
    if let Some(settings) = &config.message_bus {
        dependencies = dependencies.register(Box::new(MessageBusCheck::new(bus.clone())), settings)?;
    }

    let runtime = DispatcherRuntime::builder()
        .store(store)
        .client(client)
        .dependencies(dependencies.build())
        .message_bus(bus)
        .config(&config)
        .build()?
        .start()
        .await?;

    info!(addr = ?runtime.local_addr(), "Dispatcher ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    if let Some(provider) = meter_provider
        && let Err(e) = provider.shutdown()
    {
        warn!(error = %e, "OTLP metrics shutdown failed");
    }

    info!("Flowgate Dispatcher shut down");

    Ok(())
}
