// src/transaction/manager.rs

//! Deployment orchestration.
//!
//! `execute` takes the cluster lock, snapshots the inventory, assembles one
//! graph per requested graph type, commits the transaction and only then
//! dispatches. Everything before the dispatch is synchronous.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{DeployError, Result};
use crate::graph::context::{CurrentState, TransactionContext, expected_node_state};
use crate::graph::roles::{NodeRoleResolver, compare_node_ids};
use crate::graph::serialized::{GraphMetadata, SerializedGraph};
use crate::graph::task::{NodeId, NodeKey, TaskId, TaskSpec};
use crate::graph::build_graph;
use crate::inventory::{ClusterId, ClusterSource, Node, SettingsSerializer};
use crate::transaction::dispatch::{Dispatcher, ExecutionMessage};
use crate::transaction::state::{
    HistoryStatus, SubTransaction, Transaction, TransactionStatus,
};
use crate::transaction::store::TransactionStore;

/// Graph type used when a request names none; the only one that receives
/// plugin stage tasks.
pub const DEFAULT_GRAPH_TYPE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub cluster_id: ClusterId,

    /// Restrict the deployment to these nodes.
    #[serde(default)]
    pub nodes: Option<Vec<NodeId>>,

    /// Graph types to run, in order; empty means the default graph.
    #[serde(default)]
    pub graph_types: Vec<String>,

    #[serde(default)]
    pub dry_run: bool,

    /// Run only these tasks; the rest stay in the graph as placeholders.
    #[serde(default)]
    pub task_names: Option<Vec<TaskId>>,

    /// Ignore previously applied state.
    #[serde(default)]
    pub force: bool,
}

impl ExecuteRequest {
    pub fn new(cluster_id: ClusterId) -> Self {
        Self {
            cluster_id,
            ..Self::default()
        }
    }
}

/// Per-node result of one task instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTaskReport {
    pub node_id: NodeKey,
    pub task: TaskId,
    pub status: HistoryStatus,
}

/// Progress report from the executor for one sub-transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUpdate {
    /// Id of the sub-transaction (the message `task_uuid`).
    pub transaction_id: Uuid,

    #[serde(default)]
    pub status: Option<TransactionStatus>,

    #[serde(default)]
    pub progress: Option<u8>,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub nodes: Vec<NodeTaskReport>,
}

impl TaskUpdate {
    pub fn new(transaction_id: Uuid) -> Self {
        Self {
            transaction_id,
            status: None,
            progress: None,
            message: None,
            nodes: Vec::new(),
        }
    }
}

pub struct TransactionsManager<D: Dispatcher> {
    source: Arc<dyn ClusterSource>,
    settings: Arc<dyn SettingsSerializer>,
    store: Arc<dyn TransactionStore>,
    dispatcher: D,
}

impl<D: Dispatcher> TransactionsManager<D> {
    pub fn new(
        source: Arc<dyn ClusterSource>,
        settings: Arc<dyn SettingsSerializer>,
        store: Arc<dyn TransactionStore>,
        dispatcher: D,
    ) -> Self {
        Self {
            source,
            settings,
            store,
            dispatcher,
        }
    }

    pub fn store(&self) -> &Arc<dyn TransactionStore> {
        &self.store
    }

    /// Start a deployment.
    ///
    /// Fatal errors (see [`DeployError::is_fatal`]) return before anything
    /// is stored. Any other failure while assembling a graph type only fails
    /// that sub-transaction.
    pub async fn execute(&mut self, request: ExecuteRequest) -> Result<Transaction> {
        let (transaction, messages) = self.prepare(&request)?;
        if messages.is_empty() {
            warn!(transaction = %transaction.id, "no graph could be assembled; nothing to dispatch");
            return Ok(transaction);
        }

        let dispatched: Vec<Uuid> = messages.iter().map(|m| m.task_uuid).collect();
        let outcome = self.dispatcher.dispatch(messages).await;
        if let Err(e) = &outcome {
            error!(transaction = %transaction.id, error = %e, "failed to dispatch deployment");
        }

        self.store.update(transaction.id, &mut |tx| {
            for sub in tx
                .subtransactions
                .iter_mut()
                .filter(|s| dispatched.contains(&s.id))
            {
                // The executor may already have reported on the sub.
                match &outcome {
                    Ok(()) if sub.status == TransactionStatus::Pending => {
                        sub.transition(TransactionStatus::Running)?
                    }
                    Err(e) if !sub.status.is_terminal() => sub.fail(e.to_string())?,
                    _ => {}
                }
            }
            tx.refresh_status();
            Ok(())
        })
    }

    /// Everything up to and including the commit; the cluster lock is held
    /// for the whole call.
    fn prepare(&self, request: &ExecuteRequest) -> Result<(Transaction, Vec<ExecutionMessage>)> {
        let cluster_id = request.cluster_id;
        let _lock = self.store.try_lock_cluster(cluster_id)?;

        if let Some(transaction_id) = self.store.active_transaction(cluster_id)? {
            return Err(DeployError::DeploymentAlreadyStarted {
                cluster_id,
                transaction_id,
            });
        }
        self.store.discard_finished(cluster_id)?;

        let cluster = self.source.cluster(cluster_id)?;
        let nodes = self.snapshot_nodes(cluster_id, request.nodes.as_deref())?;
        let expected = self.settings.serialize(&cluster, &nodes)?;
        let current = if request.force {
            CurrentState::new()
        } else {
            self.current_state(cluster_id, &nodes)?
        };

        let context = TransactionContext::new(expected.clone(), current);
        let resolver = NodeRoleResolver::from_nodes(&nodes);
        let metadata = GraphMetadata {
            fault_tolerance_groups: cluster.fault_tolerance_groups.clone(),
        };

        let mut transaction = Transaction::new(cluster_id, request.dry_run, cluster.settings.clone());
        let mut messages = Vec::new();

        let default_graph = [DEFAULT_GRAPH_TYPE.to_string()];
        let graph_types = if request.graph_types.is_empty() {
            &default_graph[..]
        } else {
            &request.graph_types[..]
        };

        for graph_type in graph_types {
            let mut sub = SubTransaction::new(graph_type.as_str(), request.dry_run);
            sub.deployment_info = expected.clone();

            let assembled = self.assemble(
                cluster_id,
                graph_type,
                &context,
                &resolver,
                request.task_names.as_deref(),
                metadata.clone(),
            );
            match assembled {
                Ok((tasks, graph)) => {
                    messages.push(ExecutionMessage::from_graph(sub.id, &graph, request.dry_run));
                    sub.tasks_snapshot = tasks;
                    sub.attach_graph(graph);
                    debug!(graph_type = %graph_type, subtransaction = %sub.id, "graph assembled");
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(graph_type = %graph_type, error = %e, "failed to assemble deployment graph");
                    sub.fail(e.to_string())?;
                }
            }
            transaction.subtransactions.push(sub);
        }

        transaction.refresh_status();
        self.store.commit(transaction.clone())?;
        info!(
            transaction = %transaction.id,
            cluster_id,
            nodes = nodes.len(),
            graphs = messages.len(),
            dry_run = request.dry_run,
            "deployment transaction committed"
        );
        Ok((transaction, messages))
    }

    fn assemble(
        &self,
        cluster_id: ClusterId,
        graph_type: &str,
        context: &TransactionContext,
        resolver: &NodeRoleResolver,
        task_names: Option<&[TaskId]>,
        metadata: GraphMetadata,
    ) -> Result<(Vec<TaskSpec>, SerializedGraph)> {
        let tasks = self.source.deployment_tasks(cluster_id, graph_type)?;
        let plugin_tasks = if graph_type == DEFAULT_GRAPH_TYPE {
            self.source.plugin_tasks(cluster_id)?
        } else {
            Vec::new()
        };
        let graph = build_graph(
            context,
            resolver,
            tasks.clone(),
            &plugin_tasks,
            task_names,
            metadata,
        )?;
        Ok((tasks, graph))
    }

    /// Nodes in scope, in node order, with pending roles folded into roles.
    fn snapshot_nodes(&self, cluster_id: ClusterId, subset: Option<&[NodeId]>) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self
            .source
            .nodes(cluster_id)?
            .into_iter()
            .filter(|n| !n.pending_deletion)
            .collect();

        if let Some(ids) = subset {
            if let Some(missing) = ids.iter().find(|id| !nodes.iter().any(|n| &n.id == *id)) {
                return Err(DeployError::NodeNotFound {
                    cluster_id,
                    node_id: missing.clone(),
                });
            }
            nodes.retain(|n| ids.contains(&n.id));
        }

        for node in nodes.iter_mut() {
            node.roles = node.effective_roles().into_iter().collect();
            node.pending_roles.clear();
        }
        nodes.sort_by(|a, b| compare_node_ids(&a.id, &b.id));
        Ok(nodes)
    }

    /// Applied state without the nodes that must be deployed from scratch.
    fn current_state(&self, cluster_id: ClusterId, nodes: &[Node]) -> Result<CurrentState> {
        let mut current = self.store.applied_state(cluster_id)?;
        let fresh: Vec<NodeKey> = nodes
            .iter()
            .filter(|n| n.needs_full_redeploy())
            .map(|n| Some(n.id.clone()))
            .collect();
        if !fresh.is_empty() {
            debug!(nodes = ?fresh, "ignoring applied state of nodes needing a full redeploy");
            for per_node in current.values_mut() {
                per_node.retain(|node, _| !fresh.contains(node));
            }
        }
        Ok(current)
    }

    /// Apply an executor report.
    ///
    /// `ready` instances of non dry-run deployments record the node's
    /// expected state as applied for the logical task.
    pub fn process_update(&self, update: TaskUpdate) -> Result<Transaction> {
        let transaction_id = self.store.find_by_subtransaction(update.transaction_id)?;

        let mut cluster_id = 0;
        let mut applied: Vec<(TaskId, NodeKey, Value)> = Vec::new();
        let transaction = self.store.update(transaction_id, &mut |tx| {
            cluster_id = tx.cluster_id;
            let sub = tx
                .subtransaction_mut(update.transaction_id)
                .ok_or(DeployError::TransactionNotFound(update.transaction_id))?;

            for report in &update.nodes {
                sub.record_history(report.task.clone(), report.node_id.clone(), report.status);
                if report.status != HistoryStatus::Ready || sub.dry_run {
                    continue;
                }
                let logical = match &sub.graph {
                    Some(graph) => graph.origin_of(&report.task).to_string(),
                    None => report.task.clone(),
                };
                let state = expected_node_state(&sub.deployment_info, &report.node_id).clone();
                applied.push((logical, report.node_id.clone(), state));
            }

            if let Some(progress) = update.progress {
                sub.set_progress(progress);
            }
            if let Some(status) = update.status {
                if status == TransactionStatus::Ready && sub.status == TransactionStatus::Pending {
                    sub.transition(TransactionStatus::Running)?;
                }
                sub.transition(status)?;
            }
            if let Some(message) = &update.message {
                sub.message = Some(message.clone());
            }

            tx.refresh_status();
            Ok(())
        })?;

        for (task_id, node, state) in applied {
            self.store.record_applied(cluster_id, &task_id, node, state)?;
        }

        debug!(
            transaction = %transaction.id,
            status = %transaction.status,
            progress = transaction.progress,
            "processed executor update"
        );
        Ok(transaction)
    }
}
