// src/graph/serializer.rs

//! Task catalogue → per-node graph with explicit cross-node edges.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::errors::{DeployError, Result};
use crate::graph::context::TransactionContext;
use crate::graph::expression::Expression;
use crate::graph::processor::process_chain;
use crate::graph::roles::{RoleResolver, compare_node_ids};
use crate::graph::serialized::{
    DirectoryEntry, Edge, GraphMetadata, GraphTask, SerializedGraph, dedup_edges,
};
use crate::graph::task::{CrossDependency, NamePattern, NodeKey, RoleSpec, TaskId, TaskKind, TaskSpec};
use crate::types::{ExecutionStrategy, ResolvePolicy};

static SYNC_NODE: NodeKey = None;

/// Serialize a flattened, cross-dependency capable task list.
///
/// Fails with [`DeployError::LegacyTaskVersion`] if any task is older than
/// the cross-dependency format; run the legacy adapter first.
pub fn serialize(
    context: &TransactionContext,
    tasks: &[TaskSpec],
    resolver: &dyn RoleResolver,
    metadata: GraphMetadata,
) -> Result<SerializedGraph> {
    ensure_cross_dependency_capable(tasks)?;

    let mut serializer = TransactionSerializer::new(context, resolver);
    serializer.process_tasks(tasks)?;
    serializer.finish(metadata)
}

fn ensure_cross_dependency_capable(tasks: &[TaskSpec]) -> Result<()> {
    match tasks.iter().find(|t| !t.is_cross_dependency_capable()) {
        Some(task) => Err(DeployError::LegacyTaskVersion {
            task: task.id.clone(),
            version: task.version.clone(),
        }),
        None => Ok(()),
    }
}

struct TransactionSerializer<'a> {
    context: &'a TransactionContext,
    resolver: &'a dyn RoleResolver,
    catalogue: BTreeMap<TaskId, &'a TaskSpec>,
    /// node → task id → effective type of the instance.
    connections: BTreeMap<NodeKey, BTreeMap<TaskId, TaskKind>>,
    directory: BTreeMap<TaskId, DirectoryEntry>,
    chains: Vec<(TaskId, Vec<NodeKey>)>,
}

impl<'a> TransactionSerializer<'a> {
    fn new(context: &'a TransactionContext, resolver: &'a dyn RoleResolver) -> Self {
        Self {
            context,
            resolver,
            catalogue: BTreeMap::new(),
            connections: BTreeMap::new(),
            directory: BTreeMap::new(),
            chains: Vec::new(),
        }
    }

    fn process_tasks(&mut self, tasks: &'a [TaskSpec]) -> Result<()> {
        for task in tasks {
            if self.catalogue.insert(task.id.clone(), task).is_some() {
                return Err(DeployError::DuplicateTask(task.id.clone()));
            }

            self.directory.insert(
                task.id.clone(),
                DirectoryEntry {
                    kind: marker_or_kind(&task.kind),
                    parameters: task.parameters.clone(),
                    fail_on_error: task.fail_on_error(),
                    condition: task.condition.clone(),
                },
            );

            let Some(nodes) = self.task_nodes(task)? else {
                debug!(task = %task.id, "task resolves to no nodes; adding a placeholder");
                self.connections
                    .entry(None)
                    .or_default()
                    .insert(task.id.clone(), TaskKind::Skipped);
                continue;
            };

            let condition = task
                .condition
                .as_deref()
                .map(Expression::parse)
                .transpose()?;

            for node in &nodes {
                let kind = if task.kind.is_marker() {
                    marker_or_kind(&task.kind)
                } else if self.should_run(task, condition.as_ref(), node)? {
                    task.kind.clone()
                } else {
                    trace!(task = %task.id, node = ?node, "condition is false; skipping");
                    TaskKind::Skipped
                };
                self.connections
                    .entry(node.clone())
                    .or_default()
                    .insert(task.id.clone(), kind);
            }

            if task.strategy == ExecutionStrategy::OneByOne && nodes.len() > 1 {
                self.chains.push((task.id.clone(), nodes));
            }
        }
        Ok(())
    }

    /// Nodes a task is bound to, in node order; `None` if it has nowhere to run.
    fn task_nodes(&self, task: &TaskSpec) -> Result<Option<Vec<NodeKey>>> {
        if task.kind == TaskKind::Stage {
            return Ok(Some(vec![None]));
        }
        let Some(roles) = &task.roles else {
            return Ok(None);
        };
        if *roles == RoleSpec::SelfRole {
            return Err(DeployError::UnresolvableSelfRole(format!("task '{}'", task.id)));
        }
        let nodes = self.resolver.resolve(roles, ResolvePolicy::All)?;
        if nodes.is_empty() {
            return Ok(None);
        }
        Ok(Some(nodes.into_iter().map(Some).collect()))
    }

    fn should_run(
        &self,
        task: &TaskSpec,
        condition: Option<&Expression>,
        node: &NodeKey,
    ) -> Result<bool> {
        match condition {
            Some(expr) => expr.is_true(&self.context.scope(task, node)),
            None => Ok(self.context.changed(&task.id, node)),
        }
    }

    fn finish(self, metadata: GraphMetadata) -> Result<SerializedGraph> {
        let mut graph = BTreeMap::new();
        for (node, tasks) in &self.connections {
            let mut instances = Vec::with_capacity(tasks.len());
            for (id, kind) in tasks {
                let Some(spec) = self.catalogue.get(id) else {
                    continue;
                };

                let mut requires = self.expand_dependencies(node, id, &spec.requires)?;
                requires.extend(self.expand_cross_dependencies(node, id, &spec.cross_depends)?);
                dedup_edges(&mut requires);

                let mut required_for = self.expand_dependencies(node, id, &spec.required_for)?;
                required_for.extend(self.expand_cross_dependencies(
                    node,
                    id,
                    &spec.cross_depended_by,
                )?);
                dedup_edges(&mut required_for);

                instances.push(GraphTask {
                    id: id.clone(),
                    kind: kind.clone(),
                    requires,
                    required_for,
                });
            }
            graph.insert(node.clone(), instances);
        }

        let mut out = SerializedGraph {
            directory: self.directory,
            graph,
            metadata,
            chain_origins: BTreeMap::new(),
        };
        for (id, nodes) in &self.chains {
            process_chain(&mut out, id, nodes);
        }

        debug!(
            tasks = out.directory.len(),
            nodes = out.graph.len(),
            chains = self.chains.len(),
            "serialized deployment graph"
        );
        Ok(out)
    }

    /// Same-node relations; tasks on the sync node are visible from every node.
    fn expand_dependencies(
        &self,
        node: &NodeKey,
        task_id: &str,
        names: &[TaskId],
    ) -> Result<Vec<Edge>> {
        let mut search = vec![node];
        if node.is_some() {
            search.push(&SYNC_NODE);
        }

        let mut edges = Vec::new();
        for name in names {
            let pattern = parse_relation_name(name)?;
            edges.extend(self.find_instances(&pattern, &search, (node, task_id), false));
        }
        Ok(edges)
    }

    fn expand_cross_dependencies(
        &self,
        node: &NodeKey,
        task_id: &str,
        dependencies: &[CrossDependency],
    ) -> Result<Vec<Edge>> {
        let mut edges = Vec::new();
        for dep in dependencies {
            let pattern = parse_relation_name(&dep.name)?;
            // `any` keeps the first node in order that hosts a match.
            let targets: Vec<NodeKey> = match &dep.role {
                Some(RoleSpec::SelfRole) => vec![node.clone()],
                Some(roles) => self
                    .resolver
                    .resolve(roles, ResolvePolicy::All)?
                    .into_iter()
                    .map(Some)
                    .collect(),
                None => {
                    let mut keys: Vec<NodeKey> = self.connections.keys().cloned().collect();
                    keys.sort_by(compare_node_keys);
                    keys
                }
            };
            let search: Vec<&NodeKey> = targets.iter().collect();
            let first_only = dep.policy == ResolvePolicy::Any;
            edges.extend(self.find_instances(&pattern, &search, (node, task_id), first_only));
        }
        Ok(edges)
    }

    /// Existing instances matching `pattern` on `nodes`, excluding `this`.
    ///
    /// With `first_only`, stops at the first node that has a match.
    fn find_instances(
        &self,
        pattern: &NamePattern,
        nodes: &[&NodeKey],
        this: (&NodeKey, &str),
        first_only: bool,
    ) -> Vec<Edge> {
        let mut edges = Vec::new();
        for &node in nodes {
            let Some(tasks) = self.connections.get(node) else {
                continue;
            };
            let before = edges.len();
            match pattern {
                NamePattern::Name(name) => {
                    if tasks.contains_key(name) && (node, name.as_str()) != this {
                        edges.push(Edge::new(name.clone(), node.clone()));
                    }
                }
                NamePattern::Pattern(_) => {
                    edges.extend(
                        tasks
                            .keys()
                            .filter(|id| pattern.matches(id) && (node, id.as_str()) != this)
                            .map(|id| Edge::new(id.clone(), node.clone())),
                    );
                }
            }
            if first_only && edges.len() > before {
                break;
            }
        }
        edges
    }
}

/// Group tasks surface as `skipped` markers; everything else keeps its type.
fn marker_or_kind(kind: &TaskKind) -> TaskKind {
    match kind {
        TaskKind::Group => TaskKind::Skipped,
        other => other.clone(),
    }
}

/// Sync node first, then node order.
fn compare_node_keys(a: &NodeKey, b: &NodeKey) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => compare_node_ids(x, y),
    }
}

fn parse_relation_name(name: &str) -> Result<NamePattern> {
    NamePattern::parse(name)
        .map_err(|e| DeployError::ConfigError(format!("invalid task name pattern '{name}': {e}")))
}
