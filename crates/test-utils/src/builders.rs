#![allow(dead_code)]

use std::collections::BTreeMap;

use deploygraph::graph::task::{
    CROSS_DEPENDENCY_VERSION, CrossDependency, PluginTask, RoleSpec, TaskKind, TaskSpec,
};
use deploygraph::graph::FaultToleranceGroup;
use deploygraph::inventory::{Cluster, ClusterId, Node, StaticInventory};
use deploygraph::types::{ExecutionStrategy, NodeStatus, ResolvePolicy};
use serde_json::Value;

fn roles(names: &[&str]) -> RoleSpec {
    RoleSpec::parse(names).expect("valid role specification")
}

/// Builder for `TaskSpec`; tasks start cross-dependency capable.
pub struct TaskBuilder {
    task: TaskSpec,
}

impl TaskBuilder {
    pub fn new(id: &str, kind: &str) -> Self {
        let mut task = TaskSpec::new(id, kind);
        task.version = Some(CROSS_DEPENDENCY_VERSION.to_string());
        Self { task }
    }

    pub fn puppet(id: &str) -> Self {
        Self::new(id, "puppet")
    }

    pub fn shell(id: &str) -> Self {
        Self::new(id, "shell")
    }

    pub fn stage(id: &str) -> Self {
        Self::new(id, "stage")
    }

    pub fn group(id: &str) -> Self {
        Self::new(id, "group")
    }

    pub fn version(mut self, version: &str) -> Self {
        self.task.version = Some(version.to_string());
        self
    }

    /// Legacy task: no version at all.
    pub fn legacy(mut self) -> Self {
        self.task.version = None;
        self
    }

    pub fn roles(mut self, names: &[&str]) -> Self {
        self.task.roles = Some(roles(names));
        self
    }

    pub fn requires(mut self, id: &str) -> Self {
        self.task.requires.push(id.to_string());
        self
    }

    pub fn required_for(mut self, id: &str) -> Self {
        self.task.required_for.push(id.to_string());
        self
    }

    /// `None` roles = any node.
    pub fn cross_depends(mut self, name: &str, on: Option<&[&str]>) -> Self {
        self.task
            .cross_depends
            .push(CrossDependency::new(name, on.map(roles)));
        self
    }

    pub fn cross_depends_any(mut self, name: &str, on: Option<&[&str]>) -> Self {
        let mut dep = CrossDependency::new(name, on.map(roles));
        dep.policy = ResolvePolicy::Any;
        self.task.cross_depends.push(dep);
        self
    }

    pub fn cross_depended_by(mut self, name: &str, on: Option<&[&str]>) -> Self {
        self.task
            .cross_depended_by
            .push(CrossDependency::new(name, on.map(roles)));
        self
    }

    pub fn condition(mut self, expression: &str) -> Self {
        self.task.condition = Some(expression.to_string());
        self
    }

    pub fn members(mut self, ids: &[&str]) -> Self {
        self.task.tasks.extend(ids.iter().map(|s| s.to_string()));
        self
    }

    pub fn groups(mut self, ids: &[&str]) -> Self {
        self.task.groups.extend(ids.iter().map(|s| s.to_string()));
        self
    }

    pub fn one_by_one(mut self) -> Self {
        self.task.strategy = ExecutionStrategy::OneByOne;
        self
    }

    pub fn parameter(mut self, key: &str, value: Value) -> Self {
        self.task.parameters.insert(key.to_string(), value);
        self
    }

    pub fn fail_on_error(mut self, val: bool) -> Self {
        self.task.fail_on_error = Some(val);
        self
    }

    pub fn build(self) -> TaskSpec {
        self.task
    }
}

/// Plugin task pinned to `stage` (e.g. `"post_deployment/100"`).
pub fn plugin_task(plugin: &str, kind: &str, stage: &str, on: &[&str]) -> PluginTask {
    PluginTask {
        id: None,
        plugin: Some(plugin.to_string()),
        kind: TaskKind::from(kind),
        roles: Some(roles(on)),
        stage: stage.to_string(),
        parameters: BTreeMap::new(),
        fail_on_error: None,
    }
}

/// Builder for `Node`; nodes start `ready` so applied state is honoured.
pub struct NodeBuilder {
    node: Node,
}

impl NodeBuilder {
    pub fn new(id: &str) -> Self {
        let mut node = Node::new(id);
        node.status = NodeStatus::Ready;
        Self { node }
    }

    pub fn roles(mut self, names: &[&str]) -> Self {
        self.node.roles.extend(names.iter().map(|s| s.to_string()));
        self
    }

    pub fn pending_roles(mut self, names: &[&str]) -> Self {
        self.node
            .pending_roles
            .extend(names.iter().map(|s| s.to_string()));
        self
    }

    pub fn status(mut self, status: NodeStatus) -> Self {
        self.node.status = status;
        self
    }

    pub fn pending_addition(mut self) -> Self {
        self.node.pending_addition = true;
        self
    }

    pub fn pending_deletion(mut self) -> Self {
        self.node.pending_deletion = true;
        self
    }

    pub fn attribute(mut self, key: &str, value: Value) -> Self {
        if !self.node.attributes.is_object() {
            self.node.attributes = Value::Object(Default::default());
        }
        if let Value::Object(map) = &mut self.node.attributes {
            map.insert(key.to_string(), value);
        }
        self
    }

    pub fn build(self) -> Node {
        self.node
    }
}

/// Builder for a single-cluster `StaticInventory`.
pub struct InventoryBuilder {
    cluster: Cluster,
    nodes: Vec<Node>,
    graphs: BTreeMap<String, Vec<TaskSpec>>,
    plugin_tasks: Vec<PluginTask>,
}

impl InventoryBuilder {
    pub fn new(cluster_id: ClusterId) -> Self {
        Self {
            cluster: Cluster {
                id: cluster_id,
                name: Some(format!("cluster-{cluster_id}")),
                settings: Value::Object(Default::default()),
                fault_tolerance_groups: Vec::new(),
            },
            nodes: Vec::new(),
            graphs: BTreeMap::new(),
            plugin_tasks: Vec::new(),
        }
    }

    pub fn settings(mut self, settings: Value) -> Self {
        self.cluster.settings = settings;
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn graph(mut self, graph_type: &str, tasks: Vec<TaskSpec>) -> Self {
        self.graphs.insert(graph_type.to_string(), tasks);
        self
    }

    pub fn plugin_task(mut self, task: PluginTask) -> Self {
        self.plugin_tasks.push(task);
        self
    }

    pub fn fault_tolerance_group(mut self, name: &str, node_ids: &[&str], tolerance: u32) -> Self {
        self.cluster.fault_tolerance_groups.push(FaultToleranceGroup {
            name: name.to_string(),
            node_ids: node_ids.iter().map(|s| s.to_string()).collect(),
            fault_tolerance: tolerance,
        });
        self
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn build(self) -> StaticInventory {
        StaticInventory::new().with_cluster(
            self.cluster,
            self.nodes,
            self.graphs,
            self.plugin_tasks,
        )
    }
}
