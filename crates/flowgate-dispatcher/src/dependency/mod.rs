// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dependency-check plugins.
//!
//! A [`DependencyCheck`] watches an external system and reports, through a
//! [`DependencyCallback`], when a dependency instance is satisfied. Checks
//! are selected by [`DependencyKind`] and registered once at startup in a
//! [`DependencyRegistry`]; initialization validates their configuration and
//! fails fast.
//!
//! Lifecycle per check: `init` once, `run` per instance, `remove` to cancel
//! an instance, `shutdown` once. Failures inside a check only ever mark its
//! own instance failed.

pub mod message_bus;

pub use message_bus::{BusMessage, MessageBus, MessageBusCheck};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// String properties handed to plugins.
pub type Props = BTreeMap<String, String>;

/// Runtime property: id of the trigger instance that owns the dependency.
pub const TRIGGER_INSTANCE_ID: &str = "trigger_instance_id";
/// Runtime property: when the trigger instance started (RFC 3339 or epoch millis).
pub const START_TIME: &str = "start_time";
/// Instance property: dependency name, used in logs.
pub const NAME: &str = "name";

/// Plugin failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    /// A required key is absent.
    #[error("{0} is required")]
    MissingConfig(String),
    /// A key has an unusable value.
    #[error("invalid value for {key}: {message}")]
    InvalidConfig {
        /// Offending key.
        key: String,
        /// Details.
        message: String,
    },
    /// No check is registered for the requested kind.
    #[error("no dependency check registered for {0}")]
    UnknownKind(String),
    /// The check failed while running.
    #[error("dependency check failed: {0}")]
    Runtime(String),
}

/// Available dependency-check implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Waits for a matching message on a topic.
    MessageBus,
}

impl DependencyKind {
    /// Configuration name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyKind::MessageBus => "message_bus",
        }
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyKind {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message_bus" | "kafka" => Ok(DependencyKind::MessageBus),
            other => Err(PluginError::UnknownKind(other.to_string())),
        }
    }
}

/// One running dependency instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyContext {
    /// Instance id.
    pub id: Uuid,
    /// Check that owns the instance.
    pub kind: DependencyKind,
    /// Dependency name.
    pub name: String,
    /// Owning trigger instance.
    pub trigger_instance_id: String,
    /// When the trigger instance started.
    pub start_time: DateTime<Utc>,
}

/// Receives instance outcomes.
pub trait DependencyCallback: Send + Sync {
    /// The dependency is satisfied.
    fn on_success(&self, context: &DependencyContext);

    /// The dependency can no longer be satisfied.
    fn on_failure(&self, context: &DependencyContext, reason: &str);
}

/// A dependency-check plugin.
#[async_trait]
pub trait DependencyCheck: Send + Sync {
    /// Which kind this check implements.
    fn kind(&self) -> DependencyKind;

    /// Validate plugin configuration. Called once before any `run`.
    fn init(&mut self, config: &Props) -> Result<(), PluginError>;

    /// Start watching one dependency instance.
    fn run(
        &self,
        instance: &Props,
        runtime: &Props,
        callback: Arc<dyn DependencyCallback>,
    ) -> Result<DependencyContext, PluginError>;

    /// Stop watching an instance. Returns `false` if it was not running.
    fn remove(&self, context: &DependencyContext) -> bool;

    /// Stop every instance, waiting up to the check's drain timeout.
    async fn shutdown(&self);
}

/// Read the runtime properties every check requires.
pub fn runtime_context(
    kind: DependencyKind,
    instance: &Props,
    runtime: &Props,
) -> Result<DependencyContext, PluginError> {
    let trigger_instance_id = runtime
        .get(TRIGGER_INSTANCE_ID)
        .ok_or_else(|| PluginError::MissingConfig(TRIGGER_INSTANCE_ID.to_string()))?
        .clone();
    let raw = runtime
        .get(START_TIME)
        .ok_or_else(|| PluginError::MissingConfig(START_TIME.to_string()))?;
    let start_time = parse_time(raw).ok_or_else(|| PluginError::InvalidConfig {
        key: START_TIME.to_string(),
        message: format!("'{}' is neither RFC 3339 nor epoch millis", raw),
    })?;

    Ok(DependencyContext {
        id: Uuid::new_v4(),
        kind,
        name: instance.get(NAME).cloned().unwrap_or_default(),
        trigger_instance_id,
        start_time,
    })
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(millis) = raw.parse::<i64>() {
        return DateTime::from_timestamp_millis(millis);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// State of a dependency instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    /// Still waiting.
    Pending,
    /// Satisfied.
    Satisfied,
    /// Failed with a reason.
    Failed(String),
    /// Removed before it finished.
    Cancelled,
}

/// A dependency instance and its state.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceRecord {
    /// Instance context.
    pub context: DependencyContext,
    /// Current state.
    pub state: InstanceState,
}

struct StateCallback {
    instances: Arc<DashMap<Uuid, InstanceRecord>>,
}

impl StateCallback {
    fn settle(&self, context: &DependencyContext, state: InstanceState) {
        let mut record = self
            .instances
            .entry(context.id)
            .or_insert_with(|| InstanceRecord {
                context: context.clone(),
                state: InstanceState::Pending,
            });
        if record.state == InstanceState::Pending {
            record.state = state;
        }
    }
}

impl DependencyCallback for StateCallback {
    fn on_success(&self, context: &DependencyContext) {
        info!(
            dependency_id = %context.id,
            name = %context.name,
            trigger_instance_id = %context.trigger_instance_id,
            "Dependency satisfied"
        );
        self.settle(context, InstanceState::Satisfied);
    }

    fn on_failure(&self, context: &DependencyContext, reason: &str) {
        warn!(
            dependency_id = %context.id,
            name = %context.name,
            reason,
            "Dependency failed"
        );
        self.settle(context, InstanceState::Failed(reason.to_string()));
    }
}

/// Builder for [`DependencyRegistry`].
#[derive(Default)]
pub struct DependencyRegistryBuilder {
    checks: HashMap<DependencyKind, Arc<dyn DependencyCheck>>,
}

impl DependencyRegistryBuilder {
    /// Initialize `check` with `config` and register it.
    pub fn register(
        mut self,
        mut check: Box<dyn DependencyCheck>,
        config: &Props,
    ) -> Result<Self, PluginError> {
        check.init(config)?;
        let kind = check.kind();
        info!(kind = %kind, "Dependency check registered");
        self.checks.insert(kind, Arc::from(check));
        Ok(self)
    }

    /// Freeze the registry.
    pub fn build(self) -> DependencyRegistry {
        DependencyRegistry {
            checks: self.checks,
            instances: Arc::new(DashMap::new()),
        }
    }
}

/// Registered checks and the instances they run.
pub struct DependencyRegistry {
    checks: HashMap<DependencyKind, Arc<dyn DependencyCheck>>,
    instances: Arc<DashMap<Uuid, InstanceRecord>>,
}

impl Default for DependencyRegistry {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl DependencyRegistry {
    /// Start an empty registry.
    pub fn builder() -> DependencyRegistryBuilder {
        DependencyRegistryBuilder::default()
    }

    /// Whether a check is registered for `kind`.
    pub fn supports(&self, kind: DependencyKind) -> bool {
        self.checks.contains_key(&kind)
    }

    /// Start a dependency instance.
    pub fn trigger(
        &self,
        kind: DependencyKind,
        instance: &Props,
        runtime: &Props,
    ) -> Result<DependencyContext, PluginError> {
        let check = self
            .checks
            .get(&kind)
            .ok_or_else(|| PluginError::UnknownKind(kind.to_string()))?;
        let callback = Arc::new(StateCallback {
            instances: self.instances.clone(),
        });

        // The callback may settle the instance before this insert runs.
        let context = check.run(instance, runtime, callback.clone()).map_err(|e| {
            warn!(kind = %kind, error = %e, "Dependency instance rejected");
            e
        })?;
        self.instances
            .entry(context.id)
            .or_insert_with(|| InstanceRecord {
                context: context.clone(),
                state: InstanceState::Pending,
            });
        Ok(context)
    }

    /// Current state of an instance.
    pub fn get(&self, id: Uuid) -> Option<InstanceRecord> {
        self.instances.get(&id).map(|r| r.clone())
    }

    /// Cancel a pending instance. Returns `false` if unknown or already settled.
    pub fn cancel(&self, id: Uuid) -> bool {
        let Some(mut record) = self.instances.get_mut(&id) else {
            return false;
        };
        if record.state != InstanceState::Pending {
            return false;
        }
        if let Some(check) = self.checks.get(&record.context.kind) {
            check.remove(&record.context);
        }
        record.state = InstanceState::Cancelled;
        true
    }

    /// Shut every check down.
    pub async fn shutdown(&self) {
        for (kind, check) in &self.checks {
            info!(kind = %kind, "Shutting down dependency check");
            check.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_context_requires_props() {
        let instance = Props::from([(NAME.to_string(), "orders".to_string())]);
        let err = runtime_context(DependencyKind::MessageBus, &instance, &Props::new()).unwrap_err();
        assert_eq!(err, PluginError::MissingConfig(TRIGGER_INSTANCE_ID.to_string()));

        let runtime = Props::from([
            (TRIGGER_INSTANCE_ID.to_string(), "t-1".to_string()),
            (START_TIME.to_string(), "yesterday".to_string()),
        ]);
        assert!(matches!(
            runtime_context(DependencyKind::MessageBus, &instance, &runtime),
            Err(PluginError::InvalidConfig { .. })
        ));

        let runtime = Props::from([
            (TRIGGER_INSTANCE_ID.to_string(), "t-1".to_string()),
            (START_TIME.to_string(), "1700000000000".to_string()),
        ]);
        let context = runtime_context(DependencyKind::MessageBus, &instance, &runtime).unwrap();
        assert_eq!(context.name, "orders");
        assert_eq!(context.start_time.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("kafka".parse::<DependencyKind>().unwrap(), DependencyKind::MessageBus);
        assert_eq!(
            "message_bus".parse::<DependencyKind>().unwrap(),
            DependencyKind::MessageBus
        );
        assert!("ftp".parse::<DependencyKind>().is_err());
    }

    #[test]
    fn test_unregistered_kind_is_rejected() {
        let registry = DependencyRegistry::default();
        assert!(!registry.supports(DependencyKind::MessageBus));
        assert!(matches!(
            registry.trigger(DependencyKind::MessageBus, &Props::new(), &Props::new()),
            Err(PluginError::UnknownKind(_))
        ));
    }
}
