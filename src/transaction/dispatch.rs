// src/transaction/dispatch.rs

//! Hand-off of assembled graphs to the remote executor.
//!
//! The manager talks to a [`Dispatcher`] instead of a concrete transport.
//! [`ChannelDispatcher`] forwards message batches over a tokio mpsc channel;
//! tests provide dispatchers that record or fail.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::{DeployError, Result};
use crate::graph::serialized::{
    DirectoryEntry, GraphMetadata, GraphTask, SerializedGraph, serialize_node_map,
};
use crate::graph::task::{NodeKey, TaskId};

/// Outbound message for one sub-transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionMessage {
    pub task_uuid: Uuid,
    pub tasks_directory: BTreeMap<TaskId, DirectoryEntry>,
    #[serde(serialize_with = "serialize_node_map")]
    pub tasks_graph: BTreeMap<NodeKey, Vec<GraphTask>>,
    pub tasks_metadata: GraphMetadata,
    pub dry_run: bool,
}

impl ExecutionMessage {
    pub fn from_graph(task_uuid: Uuid, graph: &SerializedGraph, dry_run: bool) -> Self {
        Self {
            task_uuid,
            tasks_directory: graph.directory.clone(),
            tasks_graph: graph.graph.clone(),
            tasks_metadata: graph.metadata.clone(),
            dry_run,
        }
    }
}

/// Delivers execution messages to the executor.
pub trait Dispatcher: Send {
    /// Deliver one deployment's messages as a single batch.
    fn dispatch(
        &mut self,
        messages: Vec<ExecutionMessage>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

pub struct ChannelDispatcher {
    tx: mpsc::Sender<Vec<ExecutionMessage>>,
}

impl ChannelDispatcher {
    pub fn new(tx: mpsc::Sender<Vec<ExecutionMessage>>) -> Self {
        Self { tx }
    }
}

impl Dispatcher for ChannelDispatcher {
    fn dispatch(
        &mut self,
        messages: Vec<ExecutionMessage>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let tx = self.tx.clone();

        Box::pin(async move {
            tx.send(messages)
                .await
                .map_err(|e| DeployError::Dispatch(format!("executor channel closed: {e}")))
        })
    }
}
