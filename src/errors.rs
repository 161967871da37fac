// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;
use uuid::Uuid;

use crate::transaction::state::TransactionStatus;

#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Duplicate task id in graph: {0}")]
    DuplicateTask(String),

    #[error("Cycle detected in deployment graph: {0}")]
    DagCycle(String),

    #[error("Invalid condition `{expression}`: {reason}")]
    Expression { expression: String, reason: String },

    #[error(
        "task '{task}' has version {version:?}; task based deployment requires every task to be cross-dependency capable"
    )]
    LegacyTaskVersion {
        task: String,
        version: Option<String>,
    },

    #[error("role 'self' cannot be resolved outside of a task relation: {0}")]
    UnresolvableSelfRole(String),

    #[error("deployment is already started for cluster {cluster_id} (transaction {transaction_id})")]
    DeploymentAlreadyStarted { cluster_id: u64, transaction_id: Uuid },

    #[error("cluster {0} is locked by another deployment request")]
    ClusterLocked(u64),

    #[error("cluster {0} not found")]
    ClusterNotFound(u64),

    #[error("node '{node_id}' not found in cluster {cluster_id}")]
    NodeNotFound { cluster_id: u64, node_id: String },

    #[error("unknown graph type '{0}'")]
    UnknownGraphType(String),

    #[error("transaction {0} not found")]
    TransactionNotFound(Uuid),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeployError {
    /// Errors that abort a whole `execute` call before anything is persisted.
    ///
    /// Everything else raised while assembling a graph is captured into the
    /// sub-transaction being built.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeployError::DeploymentAlreadyStarted { .. }
                | DeployError::ClusterLocked(_)
                | DeployError::ClusterNotFound(_)
                | DeployError::NodeNotFound { .. }
                | DeployError::LegacyTaskVersion { .. }
                | DeployError::UnresolvableSelfRole(_)
        )
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, DeployError>;
