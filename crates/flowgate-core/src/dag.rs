// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow DAG snapshots.
//!
//! A [`FlowDag`] is the serialized graph stored with every execution. It is
//! validated on construction (and therefore on deserialization): node ids are
//! unique, every upstream reference resolves, and the graph is acyclic. Nodes
//! are kept in topological order so that iteration always visits upstream
//! nodes first.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::NodeStatus;

/// Errors raised when a DAG snapshot is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DagError {
    /// The flow has no nodes.
    #[error("flow has no nodes")]
    Empty,
    /// Two nodes share the same job id.
    #[error("duplicate node '{0}'")]
    DuplicateNode(String),
    /// A node references an upstream node that does not exist.
    #[error("node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency {
        /// The node holding the reference.
        node: String,
        /// The missing upstream id.
        dependency: String,
    },
    /// The graph contains a cycle through the listed node.
    #[error("node dependency cycle detected at '{0}'")]
    Cycle(String),
}

/// A single job inside a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagNode {
    /// Job id, unique within the flow.
    pub job_id: String,
    /// Job type, resolved to a job runner by the executor.
    #[serde(default = "default_job_type")]
    pub job_type: String,
    /// Upstream job ids.
    #[serde(default)]
    pub upstream: Vec<String>,
    /// Static job configuration.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Current status.
    #[serde(default = "default_node_status")]
    pub status: NodeStatus,
    /// When the node started running.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// When the node reached a terminal status.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Properties merged from direct upstream nodes before the node starts.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Opaque key-value outputs produced by the job.
    #[serde(default)]
    pub generated_properties: BTreeMap<String, String>,
}

fn default_job_type() -> String {
    "noop".to_string()
}

fn default_node_status() -> NodeStatus {
    NodeStatus::Ready
}

impl DagNode {
    /// Create a ready node with the given upstream dependencies.
    pub fn new(job_id: impl Into<String>, upstream: &[&str]) -> Self {
        Self {
            job_id: job_id.into(),
            job_type: default_job_type(),
            upstream: upstream.iter().map(|s| s.to_string()).collect(),
            config: BTreeMap::new(),
            status: NodeStatus::Ready,
            start_time: None,
            end_time: None,
            inputs: BTreeMap::new(),
            generated_properties: BTreeMap::new(),
        }
    }

    /// Set the job type.
    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = job_type.into();
        self
    }

    /// Add a configuration entry.
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Mark the node as disabled.
    pub fn disabled(mut self) -> Self {
        self.status = NodeStatus::Disabled;
        self
    }
}

/// Validated, topologically ordered flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<DagNode>", into = "Vec<DagNode>")]
pub struct FlowDag {
    nodes: Vec<DagNode>,
    index: HashMap<String, usize>,
    downstream: Vec<Vec<usize>>,
}

impl FlowDag {
    /// Validate the nodes and build the graph.
    pub fn new(nodes: Vec<DagNode>) -> Result<Self, DagError> {
        if nodes.is_empty() {
            return Err(DagError::Empty);
        }

        let mut positions: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if positions.insert(node.job_id.as_str(), i).is_some() {
                return Err(DagError::DuplicateNode(node.job_id.clone()));
            }
        }

        // Kahn's algorithm over the input order, preserving it among peers.
        let mut in_degree = vec![0usize; nodes.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for dep in &node.upstream {
                let Some(&parent) = positions.get(dep.as_str()) else {
                    return Err(DagError::UnknownDependency {
                        node: node.job_id.clone(),
                        dependency: dep.clone(),
                    });
                };
                if parent == i {
                    return Err(DagError::Cycle(node.job_id.clone()));
                }
                children[parent].push(i);
                in_degree[i] += 1;
            }
        }

        let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &child in &children[i] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    ready.push_back(child);
                }
            }
        }

        if order.len() != nodes.len() {
            let stuck = (0..nodes.len())
                .find(|&i| in_degree[i] > 0)
                .map(|i| nodes[i].job_id.clone())
                .unwrap_or_default();
            return Err(DagError::Cycle(stuck));
        }

        let mut slots: Vec<Option<DagNode>> = nodes.into_iter().map(Some).collect();
        let sorted: Vec<DagNode> = order.iter().filter_map(|&i| slots[i].take()).collect();

        let index: HashMap<String, usize> = sorted
            .iter()
            .enumerate()
            .map(|(i, n)| (n.job_id.clone(), i))
            .collect();
        let mut downstream = vec![Vec::new(); sorted.len()];
        for (i, node) in sorted.iter().enumerate() {
            for dep in &node.upstream {
                downstream[index[dep]].push(i);
            }
        }

        Ok(Self {
            nodes: sorted,
            index,
            downstream,
        })
    }

    /// Nodes in topological order.
    pub fn nodes(&self) -> &[DagNode] {
        &self.nodes
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false for a validated DAG.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node by job id.
    pub fn node(&self, job_id: &str) -> Option<&DagNode> {
        self.index.get(job_id).map(|&i| &self.nodes[i])
    }

    pub(crate) fn position(&self, job_id: &str) -> Option<usize> {
        self.index.get(job_id).copied()
    }

    pub(crate) fn node_at(&self, pos: usize) -> &DagNode {
        &self.nodes[pos]
    }

    pub(crate) fn node_at_mut(&mut self, pos: usize) -> &mut DagNode {
        &mut self.nodes[pos]
    }

    pub(crate) fn downstream_of(&self, pos: usize) -> &[usize] {
        &self.downstream[pos]
    }

    pub(crate) fn upstream_positions(&self, pos: usize) -> Vec<usize> {
        self.nodes[pos]
            .upstream
            .iter()
            .filter_map(|dep| self.index.get(dep).copied())
            .collect()
    }

    /// Status of every node, keyed by job id.
    pub fn statuses(&self) -> BTreeMap<String, NodeStatus> {
        self.nodes
            .iter()
            .map(|n| (n.job_id.clone(), n.status))
            .collect()
    }

    /// Job ids of nodes that failed.
    pub fn failed_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Failed)
            .map(|n| n.job_id.clone())
            .collect()
    }

    /// Whether the two snapshots describe the same graph (ids and edges).
    pub fn same_shape(&self, other: &FlowDag) -> bool {
        self.nodes.len() == other.nodes.len()
            && self.nodes.iter().all(|n| {
                other
                    .node(&n.job_id)
                    .is_some_and(|o| o.upstream == n.upstream)
            })
    }

    /// Reset in-flight nodes so the flow can resume elsewhere.
    ///
    /// Finished nodes keep their results; queued, running, and killed nodes go
    /// back to READY.
    pub fn reset_for_resume(&mut self) {
        for node in &mut self.nodes {
            if matches!(
                node.status,
                NodeStatus::Queued | NodeStatus::Running | NodeStatus::Killed
            ) {
                node.status = NodeStatus::Ready;
                node.start_time = None;
                node.end_time = None;
            }
        }
    }
}

impl TryFrom<Vec<DagNode>> for FlowDag {
    type Error = DagError;

    fn try_from(nodes: Vec<DagNode>) -> Result<Self, Self::Error> {
        FlowDag::new(nodes)
    }
}

impl From<FlowDag> for Vec<DagNode> {
    fn from(dag: FlowDag) -> Self {
        dag.nodes
    }
}
