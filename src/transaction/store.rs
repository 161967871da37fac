// src/transaction/store.rs

//! Transaction persistence, the per-cluster deployment lock and the
//! applied-state ledger.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::errors::{DeployError, Result};
use crate::graph::context::CurrentState;
use crate::graph::task::NodeKey;
use crate::inventory::ClusterId;
use crate::transaction::state::{DEPLOYMENT_TASK_NAME, Transaction};

/// Storage used by the transactions manager.
pub trait TransactionStore: Send + Sync {
    /// Take the advisory deployment lock of a cluster without waiting.
    ///
    /// Fails with [`DeployError::ClusterLocked`] if it is already held.
    fn try_lock_cluster(&self, cluster_id: ClusterId) -> Result<ClusterLock>;

    /// The pending or running deployment of a cluster, if any.
    fn active_transaction(&self, cluster_id: ClusterId) -> Result<Option<Uuid>>;

    /// Drop finished deployments of a cluster; returns how many were removed.
    fn discard_finished(&self, cluster_id: ClusterId) -> Result<usize>;

    fn commit(&self, transaction: Transaction) -> Result<()>;

    /// Apply `f` to a stored transaction and return the updated copy.
    ///
    /// Nothing is written if `f` fails.
    fn update(
        &self,
        id: Uuid,
        f: &mut dyn FnMut(&mut Transaction) -> Result<()>,
    ) -> Result<Transaction>;

    fn get(&self, id: Uuid) -> Result<Transaction>;

    /// Id of the transaction owning a sub-transaction.
    fn find_by_subtransaction(&self, subtransaction_id: Uuid) -> Result<Uuid>;

    /// State recorded per task and node when tasks last succeeded.
    fn applied_state(&self, cluster_id: ClusterId) -> Result<CurrentState>;

    fn record_applied(
        &self,
        cluster_id: ClusterId,
        task_id: &str,
        node: NodeKey,
        state: Value,
    ) -> Result<()>;
}

type LockTable = Arc<Mutex<HashSet<ClusterId>>>;

/// Held deployment lock; released on drop.
#[derive(Debug)]
pub struct ClusterLock {
    cluster_id: ClusterId,
    table: LockTable,
}

impl ClusterLock {
    fn acquire(table: &LockTable, cluster_id: ClusterId) -> Result<Self> {
        if !table.lock().insert(cluster_id) {
            return Err(DeployError::ClusterLocked(cluster_id));
        }
        trace!(cluster_id, "cluster lock acquired");
        Ok(Self {
            cluster_id,
            table: Arc::clone(table),
        })
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }
}

impl Drop for ClusterLock {
    fn drop(&mut self) {
        self.table.lock().remove(&self.cluster_id);
        trace!(cluster_id = self.cluster_id, "cluster lock released");
    }
}

/// Process-local [`TransactionStore`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    locks: LockTable,
    transactions: Mutex<BTreeMap<Uuid, Transaction>>,
    applied: Mutex<BTreeMap<ClusterId, CurrentState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored transaction of a cluster, oldest first.
    pub fn transactions(&self, cluster_id: ClusterId) -> Vec<Transaction> {
        let mut found: Vec<Transaction> = self
            .transactions
            .lock()
            .values()
            .filter(|t| t.cluster_id == cluster_id)
            .cloned()
            .collect();
        found.sort_by_key(|t| t.created_at);
        found
    }
}

impl TransactionStore for InMemoryStore {
    fn try_lock_cluster(&self, cluster_id: ClusterId) -> Result<ClusterLock> {
        ClusterLock::acquire(&self.locks, cluster_id)
    }

    fn active_transaction(&self, cluster_id: ClusterId) -> Result<Option<Uuid>> {
        Ok(self
            .transactions
            .lock()
            .values()
            .find(|t| t.cluster_id == cluster_id && t.name == DEPLOYMENT_TASK_NAME && t.is_active())
            .map(|t| t.id))
    }

    fn discard_finished(&self, cluster_id: ClusterId) -> Result<usize> {
        let mut transactions = self.transactions.lock();
        let before = transactions.len();
        transactions.retain(|_, t| {
            !(t.cluster_id == cluster_id && t.name == DEPLOYMENT_TASK_NAME && !t.is_active())
        });
        let removed = before - transactions.len();
        if removed > 0 {
            debug!(cluster_id, removed, "discarded finished deployments");
        }
        Ok(removed)
    }

    fn commit(&self, transaction: Transaction) -> Result<()> {
        self.transactions.lock().insert(transaction.id, transaction);
        Ok(())
    }

    fn update(
        &self,
        id: Uuid,
        f: &mut dyn FnMut(&mut Transaction) -> Result<()>,
    ) -> Result<Transaction> {
        let mut transactions = self.transactions.lock();
        let stored = transactions
            .get_mut(&id)
            .ok_or(DeployError::TransactionNotFound(id))?;
        let mut updated = stored.clone();
        f(&mut updated)?;
        *stored = updated.clone();
        Ok(updated)
    }

    fn get(&self, id: Uuid) -> Result<Transaction> {
        self.transactions
            .lock()
            .get(&id)
            .cloned()
            .ok_or(DeployError::TransactionNotFound(id))
    }

    fn find_by_subtransaction(&self, subtransaction_id: Uuid) -> Result<Uuid> {
        self.transactions
            .lock()
            .values()
            .find(|t| t.subtransaction(subtransaction_id).is_some())
            .map(|t| t.id)
            .ok_or(DeployError::TransactionNotFound(subtransaction_id))
    }

    fn applied_state(&self, cluster_id: ClusterId) -> Result<CurrentState> {
        Ok(self
            .applied
            .lock()
            .get(&cluster_id)
            .cloned()
            .unwrap_or_default())
    }

    fn record_applied(
        &self,
        cluster_id: ClusterId,
        task_id: &str,
        node: NodeKey,
        state: Value,
    ) -> Result<()> {
        trace!(cluster_id, task = %task_id, node = ?node, "recording applied state");
        self.applied
            .lock()
            .entry(cluster_id)
            .or_default()
            .entry(task_id.to_string())
            .or_default()
            .insert(node, state);
        Ok(())
    }
}
