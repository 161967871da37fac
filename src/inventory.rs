// src/inventory.rs

//! Cluster and node inventory.
//!
//! The manager only talks to [`ClusterSource`] and [`SettingsSerializer`];
//! [`StaticInventory`] backs both with data loaded from a scenario file.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::errors::{DeployError, Result};
use crate::graph::context::ExpectedState;
use crate::graph::roles::sort_node_ids;
use crate::graph::serialized::FaultToleranceGroup;
use crate::graph::task::{NodeId, PluginTask, TaskSpec};
use crate::types::NodeStatus;

pub type ClusterId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,

    #[serde(default)]
    pub name: Option<String>,

    /// Roles already deployed on the node.
    #[serde(default)]
    pub roles: Vec<String>,

    /// Roles assigned but not yet deployed.
    #[serde(default)]
    pub pending_roles: Vec<String>,

    #[serde(default)]
    pub status: NodeStatus,

    #[serde(default)]
    pub pending_addition: bool,

    #[serde(default)]
    pub pending_deletion: bool,

    /// Free-form node data exposed to task conditions as `node.attributes`.
    #[serde(default)]
    pub attributes: Value,
}

impl Node {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            roles: Vec::new(),
            pending_roles: Vec::new(),
            status: NodeStatus::default(),
            pending_addition: false,
            pending_deletion: false,
            attributes: Value::Null,
        }
    }

    /// Assigned plus pending roles.
    pub fn effective_roles(&self) -> BTreeSet<String> {
        self.roles
            .iter()
            .chain(self.pending_roles.iter())
            .cloned()
            .collect()
    }

    /// Nodes with nothing applied yet get every task regardless of
    /// previously recorded state.
    pub fn needs_full_redeploy(&self) -> bool {
        self.status == NodeStatus::Discover || self.pending_addition
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,

    #[serde(default)]
    pub name: Option<String>,

    /// Cluster-wide settings handed to every node.
    #[serde(default)]
    pub settings: Value,

    #[serde(default)]
    pub fault_tolerance_groups: Vec<FaultToleranceGroup>,
}

/// Read access to clusters, their nodes and their task catalogues.
pub trait ClusterSource: Send + Sync {
    fn cluster(&self, cluster_id: ClusterId) -> Result<Cluster>;

    /// Every node of the cluster, including those pending deletion.
    fn nodes(&self, cluster_id: ClusterId) -> Result<Vec<Node>>;

    /// Task catalogue of one graph type.
    fn deployment_tasks(&self, cluster_id: ClusterId, graph_type: &str) -> Result<Vec<TaskSpec>>;

    /// Legacy stage-pinned tasks contributed by plugins.
    fn plugin_tasks(&self, cluster_id: ClusterId) -> Result<Vec<PluginTask>>;
}

/// Computes the expected state of every node for a deployment.
pub trait SettingsSerializer: Send + Sync {
    fn serialize(&self, cluster: &Cluster, nodes: &[Node]) -> Result<ExpectedState>;
}

/// Expected node state built from node data and cluster settings.
///
/// Node status is not part of the state: a status change alone changes
/// nothing to deploy.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSettingsSerializer;

impl SettingsSerializer for DefaultSettingsSerializer {
    fn serialize(&self, cluster: &Cluster, nodes: &[Node]) -> Result<ExpectedState> {
        let mut state = ExpectedState::new();

        let mut uids: Vec<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
        sort_node_ids(&mut uids);

        state.insert(
            None,
            json!({
                "cluster": {
                    "id": cluster.id,
                    "name": cluster.name,
                    "settings": cluster.settings,
                },
                "nodes": uids,
            }),
        );

        for node in nodes {
            state.insert(
                Some(node.id.clone()),
                json!({
                    "uid": node.id,
                    "name": node.name,
                    "roles": node.effective_roles(),
                    "attributes": node.attributes,
                    "cluster": cluster.settings,
                }),
            );
        }

        Ok(state)
    }
}

/// In-memory [`ClusterSource`] over a fixed set of clusters.
///
/// Node and settings data can be replaced through a shared reference so a
/// running manager sees inventory changes between deployments.
#[derive(Debug, Default)]
pub struct StaticInventory {
    clusters: RwLock<BTreeMap<ClusterId, ClusterEntry>>,
}

#[derive(Debug, Clone)]
struct ClusterEntry {
    cluster: Cluster,
    nodes: Vec<Node>,
    graphs: BTreeMap<String, Vec<TaskSpec>>,
    plugin_tasks: Vec<PluginTask>,
}

impl StaticInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster(
        self,
        cluster: Cluster,
        nodes: Vec<Node>,
        graphs: BTreeMap<String, Vec<TaskSpec>>,
        plugin_tasks: Vec<PluginTask>,
    ) -> Self {
        self.clusters.write().insert(
            cluster.id,
            ClusterEntry {
                cluster,
                nodes,
                graphs,
                plugin_tasks,
            },
        );
        self
    }

    /// Replace the nodes of a cluster (e.g. after a node was added).
    pub fn set_nodes(&self, cluster_id: ClusterId, nodes: Vec<Node>) -> Result<()> {
        self.with_entry_mut(cluster_id, |entry| entry.nodes = nodes)
    }

    /// Replace the settings of a cluster.
    pub fn set_settings(&self, cluster_id: ClusterId, settings: Value) -> Result<()> {
        self.with_entry_mut(cluster_id, |entry| entry.cluster.settings = settings)
    }

    fn with_entry<T>(&self, cluster_id: ClusterId, f: impl FnOnce(&ClusterEntry) -> T) -> Result<T> {
        let clusters = self.clusters.read();
        let entry = clusters
            .get(&cluster_id)
            .ok_or(DeployError::ClusterNotFound(cluster_id))?;
        Ok(f(entry))
    }

    fn with_entry_mut(
        &self,
        cluster_id: ClusterId,
        f: impl FnOnce(&mut ClusterEntry),
    ) -> Result<()> {
        let mut clusters = self.clusters.write();
        let entry = clusters
            .get_mut(&cluster_id)
            .ok_or(DeployError::ClusterNotFound(cluster_id))?;
        f(entry);
        Ok(())
    }
}

impl ClusterSource for StaticInventory {
    fn cluster(&self, cluster_id: ClusterId) -> Result<Cluster> {
        self.with_entry(cluster_id, |entry| entry.cluster.clone())
    }

    fn nodes(&self, cluster_id: ClusterId) -> Result<Vec<Node>> {
        self.with_entry(cluster_id, |entry| entry.nodes.clone())
    }

    fn deployment_tasks(&self, cluster_id: ClusterId, graph_type: &str) -> Result<Vec<TaskSpec>> {
        self.with_entry(cluster_id, |entry| entry.graphs.get(graph_type).cloned())?
            .ok_or_else(|| DeployError::UnknownGraphType(graph_type.to_string()))
    }

    fn plugin_tasks(&self, cluster_id: ClusterId) -> Result<Vec<PluginTask>> {
        self.with_entry(cluster_id, |entry| entry.plugin_tasks.clone())
    }
}
