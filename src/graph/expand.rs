// src/graph/expand.rs

//! Flattens group tasks into a plain task catalogue.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::errors::{DeployError, Result};
use crate::graph::task::{RoleSpec, TaskId, TaskKind, TaskSpec};

/// Expand group membership into a flat catalogue.
///
/// Members without roles of their own take the union of the roles of every
/// group listing them. Groups stay in the catalogue as `skipped` markers so
/// relations naming them keep resolving. Declaration order is preserved.
pub fn expand(raw: Vec<TaskSpec>) -> Result<Vec<TaskSpec>> {
    let mut seen: HashSet<&str> = HashSet::new();
    for task in &raw {
        if !seen.insert(task.id.as_str()) {
            return Err(DeployError::DuplicateTask(task.id.clone()));
        }
    }

    let inherited = inherited_roles(&raw);

    let expanded: Vec<TaskSpec> = raw
        .into_iter()
        .map(|mut task| {
            if task.kind == TaskKind::Group {
                task.kind = TaskKind::Skipped;
            }
            if task.roles.is_none() {
                if let Some(roles) = inherited.get(&task.id) {
                    debug!(task = %task.id, roles = %roles, "inheriting roles from group");
                    task.roles = Some(roles.clone());
                }
            }
            task
        })
        .collect();

    Ok(expanded)
}

/// member id → merged roles of the groups listing it.
fn inherited_roles(tasks: &[TaskSpec]) -> BTreeMap<TaskId, RoleSpec> {
    let mut inherited: BTreeMap<TaskId, RoleSpec> = BTreeMap::new();
    for group in tasks.iter().filter(|t| t.kind == TaskKind::Group) {
        let Some(roles) = &group.roles else {
            continue;
        };
        for member in &group.tasks {
            inherited
                .entry(member.clone())
                .and_modify(|existing| *existing = existing.merge(roles))
                .or_insert_with(|| roles.clone());
        }
    }
    inherited
}
