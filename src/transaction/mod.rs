// src/transaction/mod.rs

//! Deployment transactions.
//!
//! - [`state`] holds transactions, sub-transactions and the status machine.
//! - [`store`] persists them together with the cluster lock and the
//!   applied-state ledger.
//! - [`dispatch`] hands assembled graphs to the executor.
//! - [`manager`] drives a deployment from request to dispatch and applies
//!   executor reports.

pub mod dispatch;
pub mod manager;
pub mod state;
pub mod store;

pub use dispatch::{ChannelDispatcher, Dispatcher, ExecutionMessage};
pub use manager::{
    DEFAULT_GRAPH_TYPE, ExecuteRequest, NodeTaskReport, TaskUpdate, TransactionsManager,
};
pub use state::{HistoryStatus, SubTransaction, Transaction, TransactionStatus};
pub use store::{ClusterLock, InMemoryStore, TransactionStore};
