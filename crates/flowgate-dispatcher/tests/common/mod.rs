// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for dispatcher integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowgate_core::{
    DagNode, Execution, ExecutionOptions, ExecutionStore, Executor, MemoryStore, Status,
};
use flowgate_dispatcher::notifier::{Mail, MailError, Mailer};
use flowgate_dispatcher::runtime::{Dispatcher, DispatcherRuntimeBuilder};
use flowgate_dispatcher::{DispatcherRuntime, executor_client::MockExecutorClient};
use tokio::sync::Mutex;

/// Mailer that keeps every mail in memory.
#[derive(Clone, Default)]
pub struct RecordingMailer {
    mails: Arc<Mutex<Vec<Mail>>>,
}

impl RecordingMailer {
    pub async fn mails(&self) -> Vec<Mail> {
        self.mails.lock().await.clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, mail: &Mail) -> Result<(), MailError> {
        self.mails.lock().await.push(mail.clone());
        Ok(())
    }
}

/// A dispatcher over a shared store with a mock executor fleet.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub client: MockExecutorClient,
    pub mailer: RecordingMailer,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(Arc::new(MemoryStore::new()), MockExecutorClient::new(), |b| b)
    }

    /// Build over an existing store and client, letting the caller tune the
    /// builder.
    pub fn with(
        store: Arc<MemoryStore>,
        client: MockExecutorClient,
        tune: impl FnOnce(DispatcherRuntimeBuilder) -> DispatcherRuntimeBuilder,
    ) -> Self {
        let mailer = RecordingMailer::default();
        let builder = DispatcherRuntime::builder()
            .store(store.clone())
            .client(Arc::new(client.clone()))
            .mailer(Arc::new(mailer.clone()))
            .executor_timeout(Duration::from_millis(200))
            .callback_base_url("http://dispatcher.test");
        let (dispatcher, _) = tune(builder).build().unwrap().assemble();
        Self {
            store,
            client,
            mailer,
            dispatcher,
        }
    }

    pub async fn executor(&self, host: &str) -> Executor {
        self.dispatcher
            .manager
            .register_executor(host, 7000, true, "admin")
            .await
            .unwrap()
    }

    pub async fn submit(&self, nodes: Vec<DagNode>, options: ExecutionOptions) -> Execution {
        self.dispatcher
            .manager
            .submit("nightly-report", nodes, options)
            .await
            .unwrap()
    }

    pub async fn submit_single(&self) -> Execution {
        self.submit(vec![DagNode::new("extract", &[])], ExecutionOptions::default())
            .await
    }

    pub async fn execution(&self, id: i64) -> Execution {
        self.store.fetch_by_id(id).await.unwrap().unwrap()
    }

    pub async fn status(&self, id: i64) -> Status {
        self.execution(id).await.status
    }

    pub async fn event_labels(&self, id: i64) -> Vec<String> {
        self.store
            .events_for(id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.label())
            .collect()
    }
}

/// a -> (b, c) -> d
pub fn diamond() -> Vec<DagNode> {
    vec![
        DagNode::new("a", &[]),
        DagNode::new("b", &["a"]),
        DagNode::new("c", &["a"]),
        DagNode::new("d", &["b", "c"]),
    ]
}
