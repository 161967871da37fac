// src/graph/legacy.rs

//! Conversion of the legacy stage/group task format into explicit
//! cross dependencies.
//!
//! Legacy catalogues order work through group tasks (one per role) and
//! plugin tasks pinned to a deployment stage. Both are rewritten here into
//! tasks the serializer understands:
//!
//! - every group without cross dependencies gets `<group>_start` and
//!   `<group>_end` anchors, and its members are linked between them;
//! - plugin tasks become a chain hung between `<stage>_start` and
//!   `<stage>_end`.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, trace};

use crate::errors::Result;
use crate::graph::roles::RoleResolver;
use crate::graph::task::{
    CROSS_DEPENDENCY_VERSION, CrossDependency, PluginTask, RoleSpec, TaskId, TaskKind, TaskSpec,
};
use crate::types::ResolvePolicy;

/// Converted groups: id → roles.
type GroupRoles = BTreeMap<TaskId, Option<RoleSpec>>;

pub struct LegacyTaskAdapter<'a> {
    resolver: &'a dyn RoleResolver,
}

impl<'a> LegacyTaskAdapter<'a> {
    pub fn new(resolver: &'a dyn RoleResolver) -> Self {
        Self { resolver }
    }

    /// Rewrite `tasks` and append `plugin_tasks`.
    ///
    /// Legacy tasks outside any converted group (other than stages) are left
    /// as they are and rejected by the serializer. Relations naming unknown
    /// ids are dropped, never reported.
    pub fn adapt(
        &self,
        mut tasks: Vec<TaskSpec>,
        plugin_tasks: &[PluginTask],
    ) -> Result<Vec<TaskSpec>> {
        let converted: GroupRoles = tasks
            .iter()
            .filter(|t| t.kind == TaskKind::Group && !t.has_cross_dependencies())
            .map(|t| (t.id.clone(), t.roles.clone()))
            .collect();

        let mut known: HashSet<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
        for group in converted.keys() {
            known.insert(start_of(group));
            known.insert(end_of(group));
        }

        let membership = group_membership(&tasks, &converted);
        for task in tasks.iter_mut() {
            if task.roles.is_some() || task.is_cross_dependency_capable() {
                continue;
            }
            if let Some(groups) = membership.get(&task.id) {
                task.roles = merged_roles(groups, &converted);
            }
        }

        let roles_by_id: GroupRoles = tasks
            .iter()
            .map(|t| (t.id.clone(), t.roles.clone()))
            .collect();

        let mut anchors: BTreeMap<TaskId, [TaskSpec; 2]> = BTreeMap::new();
        for group in tasks.iter().filter(|t| converted.contains_key(&t.id)) {
            anchors.insert(
                group.id.clone(),
                group_anchors(group, &tasks, &converted, &known),
            );
        }

        let mut adapted = Vec::with_capacity(tasks.len() + 2 * anchors.len());
        for mut task in tasks {
            let groups = membership.get(&task.id).map(Vec::as_slice);
            let structural = converted.contains_key(&task.id) || task.kind == TaskKind::Stage;
            if !task.is_cross_dependency_capable() && (groups.is_some() || structural) {
                let groups = groups.unwrap_or(&[]);
                self.adapt_legacy_task(&mut task, groups, &roles_by_id, &converted)?;
            }
            let extra = anchors.remove(&task.id);
            adapted.push(task);
            if let Some(pair) = extra {
                adapted.extend(pair);
            }
        }

        add_back_edges(&mut adapted);

        let plugin = adapt_plugin_tasks(plugin_tasks, &known);
        if !plugin.is_empty() {
            debug!(count = plugin.len(), "adapted plugin stage tasks");
        }
        adapted.extend(plugin);

        Ok(adapted)
    }

    fn adapt_legacy_task(
        &self,
        task: &mut TaskSpec,
        groups: &[TaskId],
        roles_by_id: &GroupRoles,
        converted: &GroupRoles,
    ) -> Result<()> {
        for group in groups {
            task.cross_depends
                .push(CrossDependency::new(start_of(group), Some(RoleSpec::SelfRole)));
            task.cross_depended_by
                .push(CrossDependency::new(end_of(group), Some(RoleSpec::SelfRole)));
        }

        if let Some(own_roles) = task.roles.clone() {
            let own_nodes = self.resolver.resolve(&own_roles, ResolvePolicy::All)?;
            let mut kept = Vec::with_capacity(task.requires.len());
            for required in std::mem::take(&mut task.requires) {
                let target_roles = roles_by_id
                    .get(&required)
                    .and_then(Option::as_ref)
                    .filter(|roles| {
                        !converted.contains_key(&required) && **roles != RoleSpec::SelfRole
                    });
                let Some(target_roles) = target_roles else {
                    kept.push(required);
                    continue;
                };
                let target_nodes = self.resolver.resolve(target_roles, ResolvePolicy::All)?;
                if own_nodes.iter().all(|n| target_nodes.contains(n)) {
                    kept.push(required);
                } else {
                    trace!(
                        task = %task.id,
                        requires = %required,
                        "requirement crosses a role boundary; using a cross dependency"
                    );
                    task.cross_depends
                        .push(CrossDependency::new(required, Some(target_roles.clone())));
                }
            }
            task.requires = kept;
        }

        trace!(task = %task.id, from = ?task.version, "upgrading legacy task");
        task.version = Some(CROSS_DEPENDENCY_VERSION.to_string());
        Ok(())
    }
}

fn start_of(group: &str) -> TaskId {
    format!("{group}_start")
}

fn end_of(group: &str) -> TaskId {
    format!("{group}_end")
}

/// member id → converted groups it belongs to, in declaration order.
fn group_membership(tasks: &[TaskSpec], converted: &GroupRoles) -> BTreeMap<TaskId, Vec<TaskId>> {
    let mut membership: BTreeMap<TaskId, Vec<TaskId>> = BTreeMap::new();
    let mut add = |member: &TaskId, group: &TaskId| {
        let groups = membership.entry(member.clone()).or_default();
        if !groups.contains(group) {
            groups.push(group.clone());
        }
    };

    for task in tasks {
        if converted.contains_key(&task.id) {
            for member in &task.tasks {
                add(member, &task.id);
            }
        }
        for group in task.groups.iter().filter(|g| converted.contains_key(*g)) {
            add(&task.id, group);
        }
    }
    membership
}

fn merged_roles(groups: &[TaskId], converted: &GroupRoles) -> Option<RoleSpec> {
    groups
        .iter()
        .filter_map(|g| converted.get(g).and_then(Option::as_ref))
        .fold(None, |acc: Option<RoleSpec>, roles| match acc {
            None => Some(roles.clone()),
            Some(merged) => Some(merged.merge(roles)),
        })
}

fn group_anchors(
    group: &TaskSpec,
    all: &[TaskSpec],
    converted: &GroupRoles,
    known: &HashSet<TaskId>,
) -> [TaskSpec; 2] {
    let mut inbound: Vec<&TaskId> = group.requires.iter().collect();
    inbound.extend(
        all.iter()
            .filter(|t| t.required_for.contains(&group.id))
            .map(|t| &t.id),
    );

    let mut start = anchor_task(start_of(&group.id), group);
    for target in inbound {
        let dependency = match converted.get(target) {
            Some(roles) => CrossDependency::new(end_of(target), roles.clone()),
            None if known.contains(target) => CrossDependency::new(target.clone(), None),
            None => {
                debug!(group = %group.id, target = %target, "dropping relation to unknown task");
                continue;
            }
        };
        if !start.cross_depends.contains(&dependency) {
            start.cross_depends.push(dependency);
        }
    }
    start
        .cross_depended_by
        .push(CrossDependency::new(end_of(&group.id), Some(RoleSpec::SelfRole)));

    let mut end = anchor_task(end_of(&group.id), group);
    for target in &group.required_for {
        if converted.contains_key(target) || !known.contains(target) {
            continue;
        }
        end.cross_depended_by
            .push(CrossDependency::new(target.clone(), None));
    }

    [start, end]
}

fn anchor_task(id: TaskId, group: &TaskSpec) -> TaskSpec {
    let mut task = TaskSpec::new(id, TaskKind::Skipped);
    task.version = Some(CROSS_DEPENDENCY_VERSION.to_string());
    task.roles = group.roles.clone();
    task
}

/// Make every exact `requires` visible from the required task as well.
fn add_back_edges(tasks: &mut [TaskSpec]) {
    let ids: HashSet<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
    let mut back: BTreeMap<TaskId, Vec<TaskId>> = BTreeMap::new();
    for task in tasks.iter() {
        for required in task.requires.iter().filter(|r| ids.contains(*r)) {
            back.entry(required.clone())
                .or_default()
                .push(task.id.clone());
        }
    }

    for task in tasks.iter_mut() {
        let Some(dependents) = back.get(&task.id) else {
            continue;
        };
        for dependent in dependents {
            if !task.required_for.contains(dependent) {
                task.required_for.push(dependent.clone());
            }
        }
    }
}

/// Turn stage-pinned plugin tasks into a chain per stage.
fn adapt_plugin_tasks(plugin_tasks: &[PluginTask], known: &HashSet<TaskId>) -> Vec<TaskSpec> {
    let mut by_stage: BTreeMap<&str, Vec<(f64, usize, &PluginTask)>> = BTreeMap::new();
    for (index, task) in plugin_tasks.iter().enumerate() {
        let (stage, weight) = task.stage_and_weight();
        by_stage.entry(stage).or_default().push((weight, index, task));
    }

    let mut adapted = Vec::with_capacity(plugin_tasks.len());
    for (stage, mut entries) in by_stage {
        entries.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let ids: Vec<TaskId> = entries
            .iter()
            .enumerate()
            .map(|(n, (_, _, task))| {
                task.id.clone().unwrap_or_else(|| {
                    format!("{}_{}_{}", task.plugin.as_deref().unwrap_or("plugin"), stage, n)
                })
            })
            .collect();

        let stage_start = start_of(stage);
        let first_anchor = if known.contains(&stage_start) {
            stage_start
        } else {
            stage.to_string()
        };

        for (n, (_, _, plugin_task)) in entries.iter().enumerate() {
            let previous = match n {
                0 => first_anchor.clone(),
                _ => ids[n - 1].clone(),
            };
            let next = ids.get(n + 1).cloned().unwrap_or_else(|| end_of(stage));

            let mut task = TaskSpec::new(ids[n].clone(), plugin_task.kind.clone());
            task.version = Some(CROSS_DEPENDENCY_VERSION.to_string());
            task.roles = plugin_task.roles.clone();
            task.parameters = plugin_task.parameters.clone();
            task.fail_on_error = plugin_task.fail_on_error;
            task.condition = Some("true".to_string());
            task.cross_depends.push(CrossDependency::new(previous, None));
            task.cross_depended_by.push(CrossDependency::new(next, None));
            adapted.push(task);
        }
    }
    adapted
}
