// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job runners.
//!
//! A node's `job_type` is resolved against a static [`JobRunnerRegistry`]
//! built at startup.
//!
//! | Job type | Runner |
//! |----------|--------|
//! | `command` | [`CommandRunner`]: shell command, `KEY=VALUE` output file |
//! | `noop` | [`NoopRunner`]: succeeds (or fails) on request, for testing flows |

pub mod command;
pub mod noop;

pub use command::CommandRunner;
pub use noop::NoopRunner;

use std::collections::HashMap;
use std::sync::Arc;

use flowgate_core::FlowDag;
use flowgate_core::job::JobRunner;
use tracing::info;

use crate::error::{Error, Result};

/// Runners by job type.
#[derive(Clone, Default)]
pub struct JobRunnerRegistry {
    runners: HashMap<&'static str, Arc<dyn JobRunner>>,
}

impl JobRunnerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a runner, replacing any runner for the same job type.
    pub fn register(mut self, runner: Arc<dyn JobRunner>) -> Self {
        let job_type = runner.job_type();
        info!(job_type, "Job runner registered");
        self.runners.insert(job_type, runner);
        self
    }

    /// Runner for `job_type`.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobRunner>> {
        self.runners.get(job_type).cloned()
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.runners.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Check that every node of `dag` has a runner.
    pub fn validate(&self, dag: &FlowDag) -> Result<()> {
        for node in dag.nodes() {
            if !self.runners.contains_key(node.job_type.as_str()) {
                return Err(Error::UnknownJobType {
                    job_id: node.job_id.clone(),
                    job_type: node.job_type.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::DagNode;

    #[test]
    fn test_validate_rejects_unknown_job_types() {
        let registry = JobRunnerRegistry::new().register(Arc::new(NoopRunner::new()));
        assert_eq!(registry.job_types(), vec!["noop"]);

        let ok = FlowDag::new(vec![DagNode::new("a", &[])]).unwrap();
        assert!(registry.validate(&ok).is_ok());

        let bad = FlowDag::new(vec![
            DagNode::new("a", &[]),
            DagNode::new("b", &["a"]).with_job_type("spark"),
        ])
        .unwrap();
        let err = registry.validate(&bad).unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownJobType { ref job_id, ref job_type } if job_id == "b" && job_type == "spark"
        ));
    }
}
