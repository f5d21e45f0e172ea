// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution lifecycle tests: node events, failure policies, kills and
//! finalization.

mod common;

use common::{Harness, diamond};
use flowgate_core::{ExecutionOptions, FailureAction, NodeEvent, NodeStatus, Status};
use flowgate_dispatcher::KillOutcome;

fn notify_options(failure_action: FailureAction) -> ExecutionOptions {
    ExecutionOptions {
        failure_action,
        notify_on_first_failure: true,
        failure_emails: vec!["ops@example.com".to_string()],
        success_emails: vec!["team@example.com".to_string()],
        ..ExecutionOptions::default()
    }
}

async fn running(harness: &Harness, options: ExecutionOptions) -> i64 {
    harness.executor("node-1").await;
    let execution = harness.submit(diamond(), options).await;
    assert_eq!(harness.dispatcher.scheduler.drain().await, 1);
    execution.id
}

async fn report(harness: &Harness, id: i64, job: &str, status: NodeStatus) -> flowgate_core::Transition {
    harness
        .dispatcher
        .manager
        .apply_node_event(NodeEvent::new(id, job, status))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_successful_flow_is_finalized_once() {
    let harness = Harness::new();
    let id = running(&harness, notify_options(FailureAction::FinishCurrentlyRunning)).await;

    for job in ["a", "b", "c", "d"] {
        report(&harness, id, job, NodeStatus::Running).await;
        let transition = report(&harness, id, job, NodeStatus::Succeeded).await;
        if job == "d" {
            assert_eq!(transition.finished(), Some(Status::Succeeded));
        } else {
            assert_eq!(transition.finished(), None);
        }
    }

    let execution = harness.execution(id).await;
    assert_eq!(execution.status, Status::Succeeded);
    assert!(execution.end_time.is_some());
    assert!(!harness.dispatcher.tracker.contains(id));
    assert_eq!(harness.dispatcher.registry.load(execution.executor_id.unwrap()), 0);

    let mails = harness.mailer.mails().await;
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].to, vec!["team@example.com".to_string()]);
    assert!(mails[0].subject.contains("succeeded"));

    // Late reports for a finished execution change nothing.
    let late = report(&harness, id, "d", NodeStatus::Failed).await;
    assert!(late.is_empty());
    assert_eq!(harness.status(id).await, Status::Succeeded);
}

#[tokio::test]
async fn test_cancel_all_kills_remaining_nodes() {
    let harness = Harness::new();
    let id = running(&harness, notify_options(FailureAction::CancelAll)).await;

    report(&harness, id, "a", NodeStatus::Running).await;
    report(&harness, id, "a", NodeStatus::Succeeded).await;
    report(&harness, id, "b", NodeStatus::Running).await;
    report(&harness, id, "c", NodeStatus::Running).await;
    let transition = report(&harness, id, "b", NodeStatus::Failed).await;

    assert_eq!(transition.first_failure(), Some("b"));
    assert_eq!(transition.cancel, vec!["c".to_string()]);
    assert_eq!(transition.finished(), Some(Status::Failed));

    let execution = harness.execution(id).await;
    assert_eq!(execution.status, Status::Failed);
    let statuses = execution.dag.statuses();
    assert_eq!(statuses["a"], NodeStatus::Succeeded);
    assert_eq!(statuses["b"], NodeStatus::Failed);
    assert_eq!(statuses["c"], NodeStatus::Killed);
    assert_eq!(statuses["d"], NodeStatus::Killed);

    let mails = harness.mailer.mails().await;
    assert_eq!(mails.len(), 2);
    assert!(mails[0].subject.contains("encountered a failure"));
    assert!(mails[1].subject.contains("has failed"));

    let labels = harness.event_labels(id).await;
    assert!(labels.contains(&"flow:first_failure:b".to_string()));
    assert_eq!(
        labels.iter().filter(|l| l.starts_with("flow:finished")).count(),
        1
    );

    // The killed node finishing late is ignored.
    assert!(report(&harness, id, "c", NodeStatus::Succeeded).await.is_empty());
}

#[tokio::test]
async fn test_finish_all_possible_skips_downstream_only() {
    let harness = Harness::new();
    let id = running(&harness, notify_options(FailureAction::FinishAllPossible)).await;

    report(&harness, id, "a", NodeStatus::Running).await;
    report(&harness, id, "a", NodeStatus::Succeeded).await;
    report(&harness, id, "b", NodeStatus::Running).await;
    report(&harness, id, "c", NodeStatus::Running).await;
    let transition = report(&harness, id, "b", NodeStatus::Failed).await;

    assert!(transition.cancel.is_empty());
    assert_eq!(transition.finished(), None);
    let execution = harness.execution(id).await;
    assert_eq!(execution.status, Status::Running);
    assert_eq!(execution.dag.statuses()["d"], NodeStatus::Skipped);
    assert_eq!(execution.dag.statuses()["c"], NodeStatus::Running);

    let transition = report(&harness, id, "c", NodeStatus::Succeeded).await;
    assert_eq!(transition.finished(), Some(Status::Failed));
    assert_eq!(harness.status(id).await, Status::Failed);
}

#[tokio::test]
async fn test_invalid_node_event_is_rejected() {
    let harness = Harness::new();
    let id = running(&harness, ExecutionOptions::default()).await;

    let err = harness
        .dispatcher
        .manager
        .apply_node_event(NodeEvent::new(id, "d", NodeStatus::Running))
        .await
        .unwrap_err();
    assert!(matches!(err, flowgate_dispatcher::Error::Flow(_)));

    let err = harness
        .dispatcher
        .manager
        .apply_node_event(NodeEvent::new(id, "missing", NodeStatus::Running))
        .await
        .unwrap_err();
    assert!(matches!(err, flowgate_dispatcher::Error::Flow(_)));
    assert_eq!(harness.status(id).await, Status::Running);
}

#[tokio::test]
async fn test_executor_stopping_mid_flow_fails_over() {
    let harness = Harness::new();
    let id = running(&harness, notify_options(FailureAction::CancelAll)).await;
    report(&harness, id, "a", NodeStatus::Running).await;

    // The executor goes down and its job ends KILLED without a kill request.
    let transition = report(&harness, id, "a", NodeStatus::Killed).await;
    assert!(transition.is_empty());
    assert!(transition.first_failure().is_none());

    let execution = harness.execution(id).await;
    assert_eq!(execution.status, Status::Running);
    assert_eq!(execution.dag.statuses()["a"], NodeStatus::Running);
    assert!(harness.mailer.mails().await.is_empty());
    assert!(
        !harness
            .event_labels(id)
            .await
            .iter()
            .any(|l| l.starts_with("flow:first_failure"))
    );

    // Back up without the flow: the next cycle fails it over.
    harness.client.forget(id).await;
    let cycle = harness.dispatcher.reconciler.run_once().await.unwrap();
    assert_eq!(cycle.requeued, 1);
    let requeued = harness.execution(id).await;
    assert_eq!(requeued.status, Status::Queued);
    assert_eq!(requeued.dag.statuses()["a"], NodeStatus::Ready);

    assert_eq!(harness.dispatcher.scheduler.drain().await, 1);
    assert_eq!(harness.status(id).await, Status::Running);
    assert_eq!(harness.client.submissions().await.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_node_events_persist_latest_dag() {
    let harness = Harness::new();
    harness.executor("node-1").await;
    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(harness.submit(diamond(), ExecutionOptions::default()).await.id);
    }
    assert_eq!(harness.dispatcher.scheduler.drain().await, 8);

    for &id in &ids {
        report(&harness, id, "a", NodeStatus::Running).await;
        report(&harness, id, "a", NodeStatus::Succeeded).await;
    }

    let mut handles = Vec::new();
    for &id in &ids {
        for (job, statuses) in [
            ("b", vec![NodeStatus::Running, NodeStatus::Succeeded]),
            ("c", vec![NodeStatus::Running]),
        ] {
            let manager = harness.dispatcher.manager.clone();
            handles.push(tokio::spawn(async move {
                for status in statuses {
                    manager
                        .apply_node_event(NodeEvent::new(id, job, status))
                        .await
                        .unwrap();
                }
            }));
        }
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for &id in &ids {
        let stored = harness.execution(id).await;
        let tracked = harness.dispatcher.tracker.get(id).unwrap();
        assert_eq!(&stored.dag, tracked.machine.dag());
        assert_eq!(stored.dag.node("b").unwrap().status, NodeStatus::Succeeded);
        assert_eq!(stored.dag.node("c").unwrap().status, NodeStatus::Running);
    }
}

#[tokio::test]
async fn test_concurrent_finalize_has_one_winner() {
    let harness = Harness::new();
    let id = running(&harness, notify_options(FailureAction::CancelAll)).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let finalizer = harness.dispatcher.finalizer.clone();
        handles.push(tokio::spawn(async move {
            finalizer.finalize(id, Status::Succeeded, None).await.unwrap()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(harness.status(id).await, Status::Succeeded);
    assert_eq!(harness.mailer.mails().await.len(), 1);
    let finished = harness
        .event_labels(id)
        .await
        .into_iter()
        .filter(|l| l == "flow:finished:SUCCEEDED")
        .count();
    assert_eq!(finished, 1);

    // A different terminal status cannot overwrite the first one.
    assert!(
        !harness
            .dispatcher
            .finalizer
            .finalize(id, Status::Failed, Some("late"))
            .await
            .unwrap()
    );
    assert_eq!(harness.status(id).await, Status::Succeeded);
}

#[tokio::test]
async fn test_kill_queued_execution() {
    let harness = Harness::new();
    let execution = harness.submit_single().await;
    assert_eq!(execution.status, Status::Queued);

    let outcome = harness
        .dispatcher
        .manager
        .kill(execution.id, "alice")
        .await
        .unwrap();
    assert_eq!(outcome, KillOutcome::Killed);

    let killed = harness.execution(execution.id).await;
    assert_eq!(killed.status, Status::Killed);
    assert_eq!(killed.failure_reason.as_deref(), Some("killed by alice"));
    assert!(harness.dispatcher.queue.is_empty().await);

    // Registering an executor afterwards dispatches nothing.
    harness.executor("node-1").await;
    assert_eq!(harness.dispatcher.scheduler.drain().await, 0);
}

#[tokio::test]
async fn test_kill_running_execution_cancels_on_executor() {
    let harness = Harness::new();
    let id = running(&harness, ExecutionOptions::default()).await;
    let executor_id = harness.execution(id).await.executor_id.unwrap();
    report(&harness, id, "a", NodeStatus::Running).await;

    let outcome = harness.dispatcher.manager.kill(id, "bob").await.unwrap();
    assert_eq!(outcome, KillOutcome::Killed);
    assert_eq!(harness.client.cancellations().await, vec![(id, executor_id)]);

    let execution = harness.execution(id).await;
    assert_eq!(execution.status, Status::Killed);
    assert!(
        execution
            .dag
            .nodes()
            .iter()
            .all(|n| n.status == NodeStatus::Killed)
    );
    assert_eq!(harness.dispatcher.registry.load(executor_id), 0);
    assert!(!harness.dispatcher.tracker.contains(id));

    let labels = harness.event_labels(id).await;
    assert!(labels.contains(&"flow:killed".to_string()));
    assert!(labels.contains(&"node:a:KILLED".to_string()));
    assert_eq!(labels.last().map(String::as_str), Some("flow:finished:KILLED"));

    let again = harness.dispatcher.manager.kill(id, "bob").await.unwrap();
    assert_eq!(again, KillOutcome::AlreadyFinished(Status::Killed));
}
