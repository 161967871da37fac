// src/config/validate.rs

use std::collections::HashSet;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{DeployError, Result};
use crate::graph::task::{MASTER_NODE_ID, TaskKind, TaskSpec};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::DeployError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_tasks(cfg)?;
    validate_global_config(cfg)?;
    validate_nodes(cfg)?;
    validate_fault_tolerance_groups(cfg)?;
    for (graph_type, section) in cfg.graph.iter() {
        let known = known_task_ids(cfg, graph_type, &section.task)?;
        validate_task_dependencies(graph_type, &section.task, &known)?;
        validate_dag(graph_type, &section.task, &known)?;
    }
    Ok(())
}

fn ensure_has_tasks(cfg: &RawConfigFile) -> Result<()> {
    if cfg.graph.values().all(|g| g.task.is_empty()) {
        return Err(DeployError::ConfigError(
            "config must contain at least one [[graph.<type>.task]] entry".to_string(),
        ));
    }
    Ok(())
}

fn validate_global_config(cfg: &RawConfigFile) -> Result<()> {
    if cfg.config.dispatch_buffer == 0 {
        return Err(DeployError::ConfigError(
            "[config].dispatch_buffer must be >= 1 (got 0)".to_string(),
        ));
    }

    if !cfg.graph.contains_key(&cfg.config.default_graph_type) {
        return Err(DeployError::ConfigError(format!(
            "default graph type '{}' has no [graph.{}] section",
            cfg.config.default_graph_type, cfg.config.default_graph_type
        )));
    }

    Ok(())
}

fn validate_nodes(cfg: &RawConfigFile) -> Result<()> {
    let mut seen = HashSet::new();
    for node in cfg.node.iter() {
        if node.id.trim().is_empty() {
            return Err(DeployError::ConfigError(
                "node ids must not be empty".to_string(),
            ));
        }
        if node.id == MASTER_NODE_ID {
            return Err(DeployError::ConfigError(format!(
                "node id '{MASTER_NODE_ID}' is reserved for the master node"
            )));
        }
        if !seen.insert(node.id.as_str()) {
            return Err(DeployError::ConfigError(format!(
                "duplicate node id '{}'",
                node.id
            )));
        }
    }
    Ok(())
}

fn validate_fault_tolerance_groups(cfg: &RawConfigFile) -> Result<()> {
    for group in cfg.cluster.fault_tolerance_groups.iter() {
        for node_id in group.node_ids.iter() {
            if !cfg.node.iter().any(|n| &n.id == node_id) {
                return Err(DeployError::ConfigError(format!(
                    "fault tolerance group '{}' references unknown node '{}'",
                    group.name, node_id
                )));
            }
        }
    }
    Ok(())
}

/// Ids a `requires` may name: the catalogue, the `_start`/`_end` anchors of
/// its groups and, for the default graph, explicit plugin task ids.
fn known_task_ids(
    cfg: &RawConfigFile,
    graph_type: &str,
    tasks: &[TaskSpec],
) -> Result<HashSet<String>> {
    let mut known = HashSet::new();
    for task in tasks.iter() {
        if !known.insert(task.id.clone()) {
            return Err(DeployError::ConfigError(format!(
                "duplicate task id '{}' in graph '{}'",
                task.id, graph_type
            )));
        }
    }
    for task in tasks.iter().filter(|t| t.kind == TaskKind::Group) {
        known.insert(format!("{}_start", task.id));
        known.insert(format!("{}_end", task.id));
    }
    if graph_type == cfg.config.default_graph_type {
        known.extend(cfg.plugin_task.iter().filter_map(|p| p.id.clone()));
    }
    Ok(known)
}

fn is_pattern(name: &str) -> bool {
    name.len() > 1 && name.starts_with('/') && name.ends_with('/')
}

fn validate_task_dependencies(
    graph_type: &str,
    tasks: &[TaskSpec],
    known: &HashSet<String>,
) -> Result<()> {
    for task in tasks.iter() {
        for dep in task.requires.iter().filter(|d| !is_pattern(d)) {
            if !known.contains(dep) {
                return Err(DeployError::ConfigError(format!(
                    "task '{}' in graph '{}' has unknown dependency '{}' in `requires`",
                    task.id, graph_type, dep
                )));
            }
            if dep == &task.id {
                return Err(DeployError::ConfigError(format!(
                    "task '{}' cannot require itself",
                    task.id
                )));
            }
        }
    }
    Ok(())
}

fn validate_dag(graph_type: &str, tasks: &[TaskSpec], known: &HashSet<String>) -> Result<()> {
    // Edge direction: dependency -> dependent.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for task in tasks.iter() {
        graph.add_node(task.id.as_str());
    }

    for task in tasks.iter() {
        for dep in task.requires.iter().filter(|d| known.contains(*d)) {
            graph.add_edge(dep.as_str(), task.id.as_str(), ());
        }
        for next in task.required_for.iter().filter(|d| known.contains(*d)) {
            graph.add_edge(task.id.as_str(), next.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => {
            let node = cycle.node_id();
            Err(DeployError::DagCycle(format!(
                "cycle detected in graph '{}' involving task '{}'",
                graph_type, node
            )))
        }
    }
}
