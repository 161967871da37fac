// src/graph/context.rs

//! Snapshot of expected vs. already-applied state for one serialization run.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::graph::expression::values_equal;
use crate::graph::task::{MASTER_NODE_ID, NodeKey, TaskId, TaskSpec};

/// Expected state per node key; `None` holds the cluster-wide data.
pub type ExpectedState = BTreeMap<NodeKey, Value>;

/// Last applied state per task id and node key.
pub type CurrentState = BTreeMap<TaskId, BTreeMap<NodeKey, Value>>;

static NULL: Value = Value::Null;

/// Expected state of `node`; master and sync node fall back to the
/// cluster-wide entry.
pub fn expected_node_state<'a>(expected: &'a ExpectedState, node: &NodeKey) -> &'a Value {
    match expected.get(node) {
        Some(state) => state,
        None if node.as_deref() == Some(MASTER_NODE_ID) => expected.get(&None).unwrap_or(&NULL),
        None => &NULL,
    }
}

/// Immutable per-run view used to evaluate conditions and diff state.
#[derive(Debug, Clone, Default)]
pub struct TransactionContext {
    expected: ExpectedState,
    current: CurrentState,
}

impl TransactionContext {
    pub fn new(expected: ExpectedState, current: CurrentState) -> Self {
        Self { expected, current }
    }

    pub fn expected(&self) -> &ExpectedState {
        &self.expected
    }

    pub fn current(&self) -> &CurrentState {
        &self.current
    }

    /// Cluster-wide data.
    pub fn cluster(&self) -> &Value {
        self.expected.get(&None).unwrap_or(&NULL)
    }

    /// Expected state of one node.
    ///
    /// The master node and the sync node fall back to the cluster-wide data.
    pub fn expected_for(&self, node: &NodeKey) -> &Value {
        expected_node_state(&self.expected, node)
    }

    /// State recorded when `task_id` last succeeded on `node`, or `null`.
    pub fn current_for(&self, task_id: &str, node: &NodeKey) -> &Value {
        self.current
            .get(task_id)
            .and_then(|per_node| per_node.get(node))
            .unwrap_or(&NULL)
    }

    /// Whether the node's expected state differs from what `task_id` last
    /// applied there.
    pub fn changed(&self, task_id: &str, node: &NodeKey) -> bool {
        !values_equal(self.expected_for(node), self.current_for(task_id, node))
    }

    /// Evaluation scope for a task condition on one node.
    pub fn scope(&self, task: &TaskSpec, node: &NodeKey) -> Value {
        json!({
            "cluster": self.cluster(),
            "node": self.expected_for(node),
            "old": self.current_for(&task.id, node),
            "task": {
                "id": task.id,
                "type": task.kind.as_str(),
                "node_id": node,
            },
        })
    }
}
