// src/graph/mod.rs

//! Deployment graph assembly.
//!
//! - [`task`] holds the task catalogue data model.
//! - [`roles`] maps role specifications onto node ids.
//! - [`legacy`] rewrites the legacy stage/group format.
//! - [`expand`] flattens group membership.
//! - [`expression`] evaluates task conditions.
//! - [`context`] carries expected vs. applied state for one run.
//! - [`serializer`] binds tasks to nodes and resolves edges.
//! - [`processor`] splits `one_by_one` tasks into chains.
//! - [`serialized`] defines the output shape.

pub mod context;
pub mod expand;
pub mod expression;
pub mod legacy;
pub mod processor;
pub mod roles;
pub mod serialized;
pub mod serializer;
pub mod task;

pub use context::{CurrentState, ExpectedState, TransactionContext};
pub use expand::expand;
pub use expression::Expression;
pub use legacy::LegacyTaskAdapter;
pub use roles::{NodeRoleResolver, RoleResolver};
pub use serialized::{
    DirectoryEntry, Edge, FaultToleranceGroup, GraphMetadata, GraphTask, SerializedGraph,
};
pub use serializer::serialize;
pub use task::{
    CrossDependency, NodeId, NodeKey, PluginTask, RoleSpec, TaskId, TaskKind, TaskSpec,
};

use tracing::debug;

use crate::errors::Result;

/// Run the whole assembly pipeline for one graph type.
///
/// `task_names`, when given, restricts the run to the named tasks: they are
/// forced to run and every other task is kept as a `skipped` placeholder so
/// ordering through it still holds.
pub fn build_graph(
    context: &TransactionContext,
    resolver: &dyn RoleResolver,
    tasks: Vec<TaskSpec>,
    plugin_tasks: &[PluginTask],
    task_names: Option<&[TaskId]>,
    metadata: GraphMetadata,
) -> Result<SerializedGraph> {
    let adapted = LegacyTaskAdapter::new(resolver).adapt(tasks, plugin_tasks)?;
    let mut flat = expand(adapted)?;

    if let Some(names) = task_names {
        restrict_to(&mut flat, names);
    }

    let graph = serialize(context, &flat, resolver, metadata)?;
    graph.check_acyclic()?;
    Ok(graph)
}

fn restrict_to(tasks: &mut [TaskSpec], names: &[TaskId]) {
    for task in tasks.iter_mut() {
        if names.contains(&task.id) {
            task.condition = Some("true".to_string());
        } else if !task.kind.is_marker() {
            task.kind = TaskKind::Skipped;
        }
    }
    debug!(selected = ?names, "restricted graph to named tasks");
}
