// src/graph/processor.rs

//! Splits a `one_by_one` task into a chain of per-node steps.
//!
//! For a task `deploy` bound to nodes `[1, 2, 3]`:
//!
//! ```text
//! deploy_start@1 -> deploy#1@2 -> deploy_end@3
//! ```
//!
//! `deploy_start` keeps the inbound edges of every instance, `deploy_end`
//! keeps the outbound ones, and every other reference to `deploy` in the
//! graph is relinked to the start or the end of the chain.

use tracing::debug;

use crate::graph::serialized::{Edge, GraphTask, SerializedGraph, dedup_edges};
use crate::graph::task::{NodeKey, TaskId};

/// Name of the element at `position` in a chain of `len` elements.
pub fn chain_task_id(task_id: &str, position: usize, len: usize) -> TaskId {
    if position == 0 {
        format!("{task_id}_start")
    } else if position + 1 == len {
        format!("{task_id}_end")
    } else {
        format!("{task_id}#{position}")
    }
}

/// Rewrite the instances of `task_id` on `nodes` (in that order) into a chain.
///
/// Returns `false` if there was nothing to chain: fewer than two instances,
/// or the task was already split.
pub fn process_chain(out: &mut SerializedGraph, task_id: &str, nodes: &[NodeKey]) -> bool {
    let mut instances: Vec<(NodeKey, GraphTask)> = Vec::new();
    for node in nodes {
        if let Some(tasks) = out.graph.get_mut(node) {
            if let Some(pos) = tasks.iter().position(|t| t.id == task_id) {
                instances.push((node.clone(), tasks.remove(pos)));
            }
        }
    }

    if instances.len() < 2 {
        for (node, task) in instances {
            insert_sorted(out, node, task);
        }
        return false;
    }

    let len = instances.len();
    let chain_nodes: Vec<NodeKey> = instances.iter().map(|(node, _)| node.clone()).collect();
    let names: Vec<TaskId> = (0..len).map(|i| chain_task_id(task_id, i, len)).collect();
    let in_chain = |edge: &Edge| edge.name == task_id && chain_nodes.contains(&edge.node_id);

    let mut external_requires = Vec::new();
    let mut external_required_for = Vec::new();
    for (_, task) in &instances {
        external_requires.extend(task.requires.iter().filter(|e| !in_chain(e)).cloned());
        external_required_for.extend(task.required_for.iter().filter(|e| !in_chain(e)).cloned());
    }
    dedup_edges(&mut external_requires);
    dedup_edges(&mut external_required_for);

    for (i, (node, task)) in instances.into_iter().enumerate() {
        let requires = if i == 0 {
            external_requires.clone()
        } else {
            vec![Edge::new(names[i - 1].clone(), chain_nodes[i - 1].clone())]
        };
        let required_for = if i + 1 == len {
            external_required_for.clone()
        } else {
            Vec::new()
        };
        insert_sorted(
            out,
            node,
            GraphTask {
                id: names[i].clone(),
                kind: task.kind,
                requires,
                required_for,
            },
        );
    }

    let first = Edge::new(names[0].clone(), chain_nodes[0].clone());
    let last = Edge::new(names[len - 1].clone(), chain_nodes[len - 1].clone());
    for task in out.graph.values_mut().flat_map(|tasks| tasks.iter_mut()) {
        let mut relinked = false;
        for edge in task.requires.iter_mut().filter(|e| in_chain(e)) {
            *edge = last.clone();
            relinked = true;
        }
        for edge in task.required_for.iter_mut().filter(|e| in_chain(e)) {
            *edge = first.clone();
            relinked = true;
        }
        if relinked {
            dedup_edges(&mut task.requires);
            dedup_edges(&mut task.required_for);
        }
    }

    if let Some(entry) = out.directory.remove(task_id) {
        for name in &names {
            out.directory.insert(name.clone(), entry.clone());
        }
    }
    for name in names {
        out.chain_origins.insert(name, task_id.to_string());
    }

    debug!(task = %task_id, steps = len, "split task into a sequential chain");
    true
}

fn insert_sorted(out: &mut SerializedGraph, node: NodeKey, task: GraphTask) {
    let tasks = out.graph.entry(node).or_default();
    let pos = tasks.partition_point(|t| t.id < task.id);
    tasks.insert(pos, task);
}
