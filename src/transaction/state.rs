// src/transaction/state.rs

//! Transaction bookkeeping and the status state machine.
//!
//! ```text
//! pending ──► running ──► ready
//!    │           │
//!    └───────────┴──────► error
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{DeployError, Result};
use crate::graph::context::ExpectedState;
use crate::graph::serialized::{SerializedGraph, serialize_node_map};
use crate::graph::task::{NodeKey, TaskId, TaskSpec};
use crate::inventory::ClusterId;

/// Name of deployment transactions.
pub const DEPLOYMENT_TASK_NAME: &str = "deployment";

/// Message set on siblings force-failed because another sub-transaction failed.
pub const ABORTED_MESSAGE: &str = "aborted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Running,
    Ready,
    Error,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::Ready | TransactionStatus::Error)
    }

    /// Forward-only transitions; same-state updates are handled by callers.
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Error) | (Running, Ready) | (Running, Error)
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Running => "running",
            TransactionStatus::Ready => "ready",
            TransactionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(TransactionStatus::Pending),
            "running" => Ok(TransactionStatus::Running),
            "ready" => Ok(TransactionStatus::Ready),
            "error" => Ok(TransactionStatus::Error),
            other => Err(format!(
                "invalid transaction status: {other} (expected pending, running, ready or error)"
            )),
        }
    }
}

/// Status of one task instance on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Pending,
    Running,
    Ready,
    Error,
    Skipped,
}

/// task id → node → status.
pub type TaskHistory = BTreeMap<TaskId, BTreeMap<NodeKey, HistoryStatus>>;

/// One graph type of a deployment.
#[derive(Debug, Clone, Serialize)]
pub struct SubTransaction {
    pub id: Uuid,
    pub graph_type: String,
    pub status: TransactionStatus,
    pub progress: u8,
    pub message: Option<String>,
    pub dry_run: bool,

    /// Set once a graph was assembled and a message built for it.
    pub assembled: bool,

    #[serde(serialize_with = "serialize_node_map")]
    pub deployment_info: ExpectedState,

    #[serde(skip)]
    pub tasks_snapshot: Vec<TaskSpec>,

    #[serde(skip)]
    pub graph: Option<SerializedGraph>,

    #[serde(serialize_with = "serialize_history")]
    pub history: TaskHistory,
}

impl SubTransaction {
    pub fn new(graph_type: impl Into<String>, dry_run: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            graph_type: graph_type.into(),
            status: TransactionStatus::Pending,
            progress: 0,
            message: None,
            dry_run,
            assembled: false,
            deployment_info: ExpectedState::new(),
            tasks_snapshot: Vec::new(),
            graph: None,
            history: TaskHistory::new(),
        }
    }

    pub fn transition(&mut self, next: TransactionStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(DeployError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next == TransactionStatus::Ready {
            self.progress = 100;
        }
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(TransactionStatus::Error)?;
        self.message = Some(message.into());
        Ok(())
    }

    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
    }

    /// Attach the assembled graph and seed the per-instance history.
    pub fn attach_graph(&mut self, graph: SerializedGraph) {
        self.history.clear();
        for (node, task) in graph.instances() {
            let status = if task.kind.is_marker() {
                HistoryStatus::Skipped
            } else {
                HistoryStatus::Pending
            };
            self.history
                .entry(task.id.clone())
                .or_default()
                .insert(node.clone(), status);
        }
        self.graph = Some(graph);
        self.assembled = true;
    }

    pub fn record_history(&mut self, task: TaskId, node: NodeKey, status: HistoryStatus) {
        self.history.entry(task).or_default().insert(node, status);
    }
}

/// A deployment of one cluster; owns its sub-transactions.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub cluster_id: ClusterId,
    pub name: String,
    pub status: TransactionStatus,
    pub progress: u8,
    pub message: Option<String>,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cluster_settings: Value,
    pub subtransactions: Vec<SubTransaction>,
}

impl Transaction {
    pub fn new(cluster_id: ClusterId, dry_run: bool, cluster_settings: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster_id,
            name: DEPLOYMENT_TASK_NAME.to_string(),
            status: TransactionStatus::Pending,
            progress: 0,
            message: None,
            dry_run,
            created_at: Utc::now(),
            finished_at: None,
            cluster_settings,
            subtransactions: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn subtransaction(&self, id: Uuid) -> Option<&SubTransaction> {
        self.subtransactions.iter().find(|s| s.id == id)
    }

    pub fn subtransaction_mut(&mut self, id: Uuid) -> Option<&mut SubTransaction> {
        self.subtransactions.iter_mut().find(|s| s.id == id)
    }

    /// Recompute the parent status from the assembled sub-transactions.
    ///
    /// Any failed sub-transaction fails the parent and aborts every sibling
    /// still pending or running.
    pub fn refresh_status(&mut self) {
        let assembled = || self.subtransactions.iter().filter(|s| s.assembled);

        let (status, progress) = if assembled().next().is_none() {
            (TransactionStatus::Error, self.progress)
        } else if assembled().any(|s| s.status == TransactionStatus::Error) {
            (TransactionStatus::Error, self.progress)
        } else if assembled().all(|s| s.status == TransactionStatus::Ready) {
            (TransactionStatus::Ready, 100)
        } else if assembled().all(|s| s.status == TransactionStatus::Pending) {
            (TransactionStatus::Pending, 0)
        } else {
            let (sum, count) = assembled().fold((0u32, 0u32), |(sum, count), s| {
                (sum + u32::from(s.progress), count + 1)
            });
            (TransactionStatus::Running, (sum / count.max(1)) as u8)
        };

        if status == TransactionStatus::Error {
            for sub in self
                .subtransactions
                .iter_mut()
                .filter(|s| !s.status.is_terminal())
            {
                sub.status = TransactionStatus::Error;
                sub.message = Some(ABORTED_MESSAGE.to_string());
            }
            if self.message.is_none() {
                self.message = self
                    .subtransactions
                    .iter()
                    .find(|s| s.message.as_deref().is_some_and(|m| m != ABORTED_MESSAGE))
                    .and_then(|s| s.message.clone());
            }
        }

        self.status = status;
        self.progress = progress;
        if status.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }
}

fn serialize_history<S: Serializer>(
    history: &TaskHistory,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    struct PerNode<'a>(&'a BTreeMap<NodeKey, HistoryStatus>);

    impl Serialize for PerNode<'_> {
        fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
            serialize_node_map(self.0, serializer)
        }
    }

    serializer.collect_map(history.iter().map(|(task, per_node)| (task, PerNode(per_node))))
}
