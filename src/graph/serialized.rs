// src/graph/serialized.rs

//! Output of the transaction serializer: task directory, per-node task
//! graph and metadata.

use std::collections::{BTreeMap, HashMap};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{DeployError, Result};
use crate::graph::task::{NodeId, NodeKey, TaskId, TaskKind};

/// A resolved dependency: task `name` on node `node_id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub name: TaskId,
    pub node_id: NodeKey,
}

impl Edge {
    pub fn new(name: impl Into<TaskId>, node_id: NodeKey) -> Self {
        Self {
            name: name.into(),
            node_id,
        }
    }
}

/// Sort edges and drop duplicate `(name, node_id)` pairs.
pub fn dedup_edges(edges: &mut Vec<Edge>) {
    edges.sort();
    edges.dedup();
}

/// A task instance bound to one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphTask {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub requires: Vec<Edge>,
    pub required_for: Vec<Edge>,
}

/// Static task data shared by every node running the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub parameters: BTreeMap<String, Value>,
    pub fail_on_error: bool,
    /// Condition source as declared; `None` means the default `changed()`.
    #[serde(default)]
    pub condition: Option<String>,
}

/// Nodes whose individual failures do not abort the whole graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultToleranceGroup {
    pub name: String,
    #[serde(default)]
    pub node_ids: Vec<NodeId>,
    /// How many nodes of the group may fail.
    #[serde(default)]
    pub fault_tolerance: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphMetadata {
    pub fault_tolerance_groups: Vec<FaultToleranceGroup>,
}

/// Serializer output for one graph type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SerializedGraph {
    pub directory: BTreeMap<TaskId, DirectoryEntry>,

    #[serde(serialize_with = "serialize_node_map")]
    pub graph: BTreeMap<NodeKey, Vec<GraphTask>>,

    pub metadata: GraphMetadata,

    /// Chain element id → the logical task id it was split from.
    #[serde(skip)]
    pub chain_origins: BTreeMap<TaskId, TaskId>,
}

impl SerializedGraph {
    /// Tasks bound to a node (`None` = sync node).
    pub fn tasks_on(&self, node: Option<&str>) -> &[GraphTask] {
        self.graph
            .get(&node.map(str::to_string))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn task(&self, node: Option<&str>, id: &str) -> Option<&GraphTask> {
        self.tasks_on(node).iter().find(|t| t.id == id)
    }

    /// Every task instance with the node it is bound to.
    pub fn instances(&self) -> impl Iterator<Item = (&NodeKey, &GraphTask)> {
        self.graph
            .iter()
            .flat_map(|(node, tasks)| tasks.iter().map(move |t| (node, t)))
    }

    /// Logical task id of a graph task id (chain elements map back to the
    /// task they were split from).
    pub fn origin_of<'a>(&'a self, id: &'a str) -> &'a str {
        self.chain_origins
            .get(id)
            .map(String::as_str)
            .unwrap_or(id)
    }

    /// Whether no instance does any work.
    pub fn is_noop(&self) -> bool {
        self.instances().all(|(_, t)| t.kind.is_marker())
    }

    /// Fail with [`DeployError::DagCycle`] if the resolved edges form a cycle.
    pub fn check_acyclic(&self) -> Result<()> {
        let mut labels: Vec<(&NodeKey, &str)> = Vec::new();
        let mut index: HashMap<(&NodeKey, &str), usize> = HashMap::new();
        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();

        for (node, task) in self.instances() {
            let i = labels.len();
            labels.push((node, task.id.as_str()));
            index.insert((node, task.id.as_str()), i);
            graph.add_node(i);
        }

        for (node, task) in self.instances() {
            let me = index[&(node, task.id.as_str())];
            for edge in &task.requires {
                if let Some(&dep) = index.get(&(&edge.node_id, edge.name.as_str())) {
                    graph.add_edge(dep, me, ());
                }
            }
            for edge in &task.required_for {
                if let Some(&next) = index.get(&(&edge.node_id, edge.name.as_str())) {
                    graph.add_edge(me, next, ());
                }
            }
        }

        match toposort(&graph, None) {
            Ok(_order) => Ok(()),
            Err(cycle) => {
                let (node, task) = labels[cycle.node_id()];
                Err(DeployError::DagCycle(format!(
                    "cycle detected in deployment graph involving task '{}' on node {}",
                    task,
                    node.as_deref().unwrap_or("null")
                )))
            }
        }
    }
}

/// Serialize a map keyed by [`NodeKey`]; the sync node becomes `"null"`.
pub fn serialize_node_map<S, V>(
    map: &BTreeMap<NodeKey, V>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
    V: Serialize,
{
    serializer.collect_map(
        map.iter()
            .map(|(node, value)| (node.as_deref().unwrap_or("null"), value)),
    )
}
