// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message-bus dependency check.
//!
//! Each instance waits for a message on `topic` whose payload matches the
//! `match` regular expression. Messages come from an in-process
//! [`MessageBus`]; the broker and schema-registry settings are validated at
//! init so a misconfigured deployment fails at startup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    DependencyCallback, DependencyCheck, DependencyContext, DependencyKind, PluginError, Props,
    runtime_context,
};

/// Plugin config: broker URL.
pub const BROKER_URL: &str = "broker.url";
/// Plugin config: schema registry URL.
pub const SCHEMA_REGISTRY_URL: &str = "schema.registry.url";
/// Instance config: topic to watch.
pub const TOPIC: &str = "topic";
/// Instance config: payload regular expression.
pub const MATCH: &str = "match";

/// Default time `shutdown` waits for instances to stop.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// A published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Topic.
    pub topic: String,
    /// Payload.
    pub payload: String,
    /// Publish time.
    pub at: DateTime<Utc>,
}

/// In-process publish/subscribe bus.
#[derive(Debug, Clone)]
pub struct MessageBus {
    sender: broadcast::Sender<BusMessage>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MessageBus {
    /// Create a bus buffering up to `capacity` messages per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a message. Returns the number of subscribers that received it.
    pub fn publish(&self, topic: impl Into<String>, payload: impl Into<String>) -> usize {
        self.sender
            .send(BusMessage {
                topic: topic.into(),
                payload: payload.into(),
                at: Utc::now(),
            })
            .unwrap_or(0)
    }

    /// Subscribe to every message published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }
}

#[derive(Debug, Clone)]
struct BusSettings {
    broker_url: String,
    schema_registry_url: String,
}

/// Dependency check backed by a [`MessageBus`].
pub struct MessageBusCheck {
    bus: MessageBus,
    settings: Option<BusSettings>,
    tasks: Arc<DashMap<Uuid, JoinHandle<()>>>,
    stop: watch::Sender<bool>,
    drain_timeout: Duration,
}

impl MessageBusCheck {
    /// Create a check listening on `bus`.
    pub fn new(bus: MessageBus) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            bus,
            settings: None,
            tasks: Arc::new(DashMap::new()),
            stop,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Override how long `shutdown` waits before aborting instances.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Number of instances still waiting.
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    fn required<'a>(props: &'a Props, key: &str) -> Result<&'a str, PluginError> {
        props
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| PluginError::MissingConfig(key.to_string()))
    }
}

#[async_trait]
impl DependencyCheck for MessageBusCheck {
    fn kind(&self) -> DependencyKind {
        DependencyKind::MessageBus
    }

    fn init(&mut self, config: &Props) -> Result<(), PluginError> {
        let settings = BusSettings {
            broker_url: Self::required(config, BROKER_URL)?.to_string(),
            schema_registry_url: Self::required(config, SCHEMA_REGISTRY_URL)?.to_string(),
        };
        info!(
            broker_url = %settings.broker_url,
            schema_registry_url = %settings.schema_registry_url,
            "Message bus dependency check initialized"
        );
        self.settings = Some(settings);
        Ok(())
    }

    fn run(
        &self,
        instance: &Props,
        runtime: &Props,
        callback: Arc<dyn DependencyCallback>,
    ) -> Result<DependencyContext, PluginError> {
        if self.settings.is_none() {
            return Err(PluginError::Runtime("check was not initialized".to_string()));
        }
        if *self.stop.borrow() {
            return Err(PluginError::Runtime("check is shutting down".to_string()));
        }

        let topic = Self::required(instance, TOPIC)?.to_string();
        let pattern = Self::required(instance, MATCH)?;
        let matcher = Regex::new(pattern).map_err(|e| PluginError::InvalidConfig {
            key: MATCH.to_string(),
            message: e.to_string(),
        })?;
        let context = runtime_context(DependencyKind::MessageBus, instance, runtime)?;

        let mut messages = self.bus.subscribe();
        let mut stop = self.stop.subscribe();
        let tasks = self.tasks.clone();
        let task_context = context.clone();

        let handle = tokio::spawn(async move {
            let context = task_context;
            loop {
                tokio::select! {
                    biased;

                    _ = stop.changed() => {
                        debug!(dependency_id = %context.id, "Dependency instance stopped");
                        break;
                    }

                    received = messages.recv() => match received {
                        Ok(message) if message.topic == topic && matcher.is_match(&message.payload) => {
                            callback.on_success(&context);
                            break;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(dependency_id = %context.id, skipped, "Dependency instance lagged behind the bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            callback.on_failure(&context, "message bus closed");
                            break;
                        }
                    }
                }
            }
            tasks.remove(&context.id);
        });
        self.tasks.insert(context.id, handle);
        if self.tasks.get(&context.id).is_some_and(|h| h.is_finished()) {
            self.tasks.remove(&context.id);
        }

        debug!(dependency_id = %context.id, name = %context.name, "Dependency instance started");
        Ok(context)
    }

    fn remove(&self, context: &DependencyContext) -> bool {
        match self.tasks.remove(&context.id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    async fn shutdown(&self) {
        info!(running = self.tasks.len(), "Shutting down message bus dependency check");
        let _ = self.stop.send(true);

        let ids: Vec<Uuid> = self.tasks.iter().map(|e| *e.key()).collect();
        let handles: Vec<JoinHandle<()>> = ids
            .into_iter()
            .filter_map(|id| self.tasks.remove(&id).map(|(_, h)| h))
            .collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        if tokio::time::timeout(self.drain_timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            error!("Message bus dependency check did not drain in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{
        DependencyRegistry, InstanceState, NAME, START_TIME, TRIGGER_INSTANCE_ID,
    };

    fn plugin_config() -> Props {
        Props::from([
            (BROKER_URL.to_string(), "kafka://broker:9092".to_string()),
            (SCHEMA_REGISTRY_URL.to_string(), "http://registry:8081".to_string()),
        ])
    }

    fn instance(pattern: &str) -> Props {
        Props::from([
            (NAME.to_string(), "orders-ready".to_string()),
            (TOPIC.to_string(), "orders".to_string()),
            (MATCH.to_string(), pattern.to_string()),
        ])
    }

    fn runtime() -> Props {
        Props::from([
            (TRIGGER_INSTANCE_ID.to_string(), "trigger-1".to_string()),
            (START_TIME.to_string(), Utc::now().to_rfc3339()),
        ])
    }

    async fn wait_for(registry: &DependencyRegistry, id: Uuid, state: InstanceState) {
        for _ in 0..100 {
            if registry.get(id).map(|r| r.state) == Some(state.clone()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("instance {id} never reached {state:?}");
    }

    #[test]
    fn test_init_requires_broker_and_schema_registry() {
        let mut check = MessageBusCheck::new(MessageBus::default());
        let mut config = plugin_config();
        config.remove(SCHEMA_REGISTRY_URL);
        assert_eq!(
            check.init(&config),
            Err(PluginError::MissingConfig(SCHEMA_REGISTRY_URL.to_string()))
        );
        assert!(check.init(&plugin_config()).is_ok());
    }

    #[tokio::test]
    async fn test_run_validates_instance_config() {
        let mut check = MessageBusCheck::new(MessageBus::default());
        check.init(&plugin_config()).unwrap();
        let callback: Arc<dyn DependencyCallback> = Arc::new(NoopCallback);

        let mut missing_topic = instance("ready");
        missing_topic.remove(TOPIC);
        assert!(matches!(
            check.run(&missing_topic, &runtime(), callback.clone()),
            Err(PluginError::MissingConfig(_))
        ));
        assert!(matches!(
            check.run(&instance("(unclosed"), &runtime(), callback.clone()),
            Err(PluginError::InvalidConfig { .. })
        ));
        assert!(matches!(
            check.run(&instance("ready"), &Props::new(), callback),
            Err(PluginError::MissingConfig(_))
        ));
        assert_eq!(check.running(), 0);
    }

    struct NoopCallback;

    impl DependencyCallback for NoopCallback {
        fn on_success(&self, _context: &DependencyContext) {}
        fn on_failure(&self, _context: &DependencyContext, _reason: &str) {}
    }

    #[tokio::test]
    async fn test_matching_message_satisfies_dependency() {
        let bus = MessageBus::default();
        let registry = DependencyRegistry::builder()
            .register(Box::new(MessageBusCheck::new(bus.clone())), &plugin_config())
            .unwrap()
            .build();

        let context = registry
            .trigger(DependencyKind::MessageBus, &instance(r"^batch-\d+ ready$"), &runtime())
            .unwrap();
        assert_eq!(registry.get(context.id).unwrap().state, InstanceState::Pending);

        bus.publish("orders", "batch-7 started");
        bus.publish("payments", "batch-7 ready");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.get(context.id).unwrap().state, InstanceState::Pending);

        bus.publish("orders", "batch-7 ready");
        wait_for(&registry, context.id, InstanceState::Satisfied).await;
    }

    #[tokio::test]
    async fn test_cancel_and_shutdown() {
        let bus = MessageBus::default();
        let registry = DependencyRegistry::builder()
            .register(
                Box::new(
                    MessageBusCheck::new(bus.clone()).with_drain_timeout(Duration::from_secs(1)),
                ),
                &plugin_config(),
            )
            .unwrap()
            .build();

        let first = registry
            .trigger(DependencyKind::MessageBus, &instance("ready"), &runtime())
            .unwrap();
        let second = registry
            .trigger(DependencyKind::MessageBus, &instance("ready"), &runtime())
            .unwrap();

        assert!(registry.cancel(first.id));
        assert!(!registry.cancel(first.id));
        assert_eq!(registry.get(first.id).unwrap().state, InstanceState::Cancelled);

        registry.shutdown().await;
        bus.publish("orders", "ready");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.get(second.id).unwrap().state, InstanceState::Pending);
        assert!(matches!(
            registry.trigger(DependencyKind::MessageBus, &instance("ready"), &runtime()),
            Err(PluginError::Runtime(_))
        ));
    }
}
