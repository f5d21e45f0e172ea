// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! A dispatcher and a real executor node talking over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use flowgate_core::protocol::FlowStatusReport;
use flowgate_core::{DagNode, Execution, ExecutionOptions, MemoryStore, NodeStatus, Status};
use flowgate_dispatcher::executor_client::{HttpClientConfig, HttpExecutorClient};
use flowgate_dispatcher::{DispatcherRuntime, KillOutcome};
use flowgate_executor::jobs::{JobRunnerRegistry, NoopRunner};
use flowgate_executor::reporter::HttpReporter;
use flowgate_executor::server::{AppState, run_http_server};
use flowgate_executor::{FlowRunner, FlowRunnerConfig};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct Cluster {
    runtime: DispatcherRuntime,
    executor_addr: SocketAddr,
    executor_stop: oneshot::Sender<()>,
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn start_executor() -> (SocketAddr, oneshot::Sender<()>) {
    let jobs = Arc::new(JobRunnerRegistry::new().register(Arc::new(NoopRunner::new())));
    let reporter = Arc::new(
        HttpReporter::new(Duration::from_secs(2), 3)
            .unwrap()
            .with_retry_backoff(Duration::from_millis(20)),
    );
    let runner = Arc::new(FlowRunner::new(jobs, reporter, FlowRunnerConfig::default()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(run_http_server(listener, AppState { runner }, async move {
        let _ = stop_rx.await;
    }));
    (addr, stop_tx)
}

async fn start_cluster() -> Cluster {
    let (executor_addr, executor_stop) = start_executor().await;

    let port = free_port();
    let client = HttpExecutorClient::new(HttpClientConfig {
        request_timeout: Duration::from_secs(2),
        retries: 0,
        retry_backoff: Duration::from_millis(10),
    })
    .unwrap();
    let runtime = DispatcherRuntime::builder()
        .store(Arc::new(MemoryStore::new()))
        .client(Arc::new(client))
        .bind_addr(SocketAddr::from(([127, 0, 0, 1], port)))
        .callback_base_url(format!("http://127.0.0.1:{}", port))
        .executor_timeout(Duration::from_secs(2))
        .dispatch_interval(Duration::from_millis(20))
        .reconcile_interval(Duration::from_millis(500))
        .health_check_interval(Duration::from_millis(500))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    runtime
        .manager()
        .register_executor("127.0.0.1", executor_addr.port(), true, "admin")
        .await
        .unwrap();

    Cluster {
        runtime,
        executor_addr,
        executor_stop,
    }
}

async fn wait_for(cluster: &Cluster, execution_id: i64, wanted: impl Fn(Status) -> bool) -> Execution {
    for _ in 0..500 {
        let execution = cluster.runtime.manager().get(execution_id).await.unwrap();
        if wanted(execution.status) {
            return execution;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("execution {} never reached the expected status", execution_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flow_completes_through_executor_callbacks() {
    let cluster = start_cluster().await;

    let execution = cluster
        .runtime
        .manager()
        .submit(
            "nightly-report",
            vec![
                DagNode::new("extract", &[]).with_config("emit.rows", "42"),
                DagNode::new("transform", &["extract"]),
                DagNode::new("load", &["transform"]).disabled(),
            ],
            ExecutionOptions::default(),
        )
        .await
        .unwrap();

    let finished = wait_for(&cluster, execution.id, |s| s.is_terminal()).await;
    assert_eq!(finished.status, Status::Succeeded);
    assert!(finished.executor_id.is_some());

    let statuses = finished.dag.statuses();
    assert_eq!(statuses["extract"], NodeStatus::Succeeded);
    assert_eq!(statuses["transform"], NodeStatus::Succeeded);
    assert_eq!(statuses["load"], NodeStatus::Skipped);
    assert_eq!(finished.dag.node("transform").unwrap().inputs["rows"], "42");

    let labels: Vec<String> = cluster
        .runtime
        .manager()
        .events(execution.id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.label())
        .collect();
    assert!(labels.contains(&"node:extract:SUCCEEDED".to_string()));
    assert_eq!(labels.last().map(String::as_str), Some("flow:finished:SUCCEEDED"));

    let _ = cluster.executor_stop.send(());
    cluster.runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_kill_reaches_the_executor() {
    let cluster = start_cluster().await;

    let execution = cluster
        .runtime
        .manager()
        .submit(
            "long-running",
            vec![DagNode::new("wait", &[]).with_config("sleep_ms", "60000")],
            ExecutionOptions::default(),
        )
        .await
        .unwrap();
    wait_for(&cluster, execution.id, |s| s == Status::Running).await;

    let outcome = cluster.runtime.manager().kill(execution.id, "alice").await.unwrap();
    assert_eq!(outcome, KillOutcome::Killed);
    let killed = cluster.runtime.manager().get(execution.id).await.unwrap();
    assert_eq!(killed.status, Status::Killed);

    let url = format!(
        "http://{}/api/v1/executions/{}/status",
        cluster.executor_addr, execution.id
    );
    let mut remote = Status::Running;
    for _ in 0..200 {
        let report: FlowStatusReport = reqwest::get(&url).await.unwrap().json().await.unwrap();
        remote = report.status;
        if remote.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(remote, Status::Killed);

    let _ = cluster.executor_stop.send(());
    cluster.runtime.shutdown().await.unwrap();
}
