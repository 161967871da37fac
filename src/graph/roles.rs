// src/graph/roles.rs

//! Role → node resolution.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::errors::{DeployError, Result};
use crate::graph::task::{MASTER_NODE_ID, NodeId, RoleSpec};
use crate::inventory::Node;
use crate::types::ResolvePolicy;

/// Maps role specifications onto concrete node ids.
///
/// Implementations must return node ids in a deterministic order (see
/// [`compare_node_ids`]); chain splitting depends on it.
pub trait RoleResolver {
    fn resolve(&self, roles: &RoleSpec, policy: ResolvePolicy) -> Result<Vec<NodeId>>;
}

/// Resolver over a snapshot of node → effective roles.
#[derive(Debug, Clone, Default)]
pub struct NodeRoleResolver {
    roles_by_node: BTreeMap<NodeId, BTreeSet<String>>,
}

impl NodeRoleResolver {
    pub fn new<I, R, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = (NodeId, R)>,
        R: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let roles_by_node = nodes
            .into_iter()
            .map(|(id, roles)| (id, roles.into_iter().map(Into::into).collect()))
            .collect();
        Self { roles_by_node }
    }

    /// Build a resolver from an inventory snapshot, using each node's
    /// effective roles (assigned plus pending).
    pub fn from_nodes(nodes: &[Node]) -> Self {
        Self::new(
            nodes
                .iter()
                .map(|node| (node.id.clone(), node.effective_roles())),
        )
    }

    /// All node ids in scope, in node order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.roles_by_node.keys().cloned().collect();
        sort_node_ids(&mut ids);
        ids
    }
}

impl RoleResolver for NodeRoleResolver {
    fn resolve(&self, roles: &RoleSpec, policy: ResolvePolicy) -> Result<Vec<NodeId>> {
        let mut resolved: Vec<NodeId> = match roles {
            RoleSpec::SelfRole => {
                return Err(DeployError::UnresolvableSelfRole(roles.to_string()));
            }
            RoleSpec::Master => vec![MASTER_NODE_ID.to_string()],
            RoleSpec::All => self.roles_by_node.keys().cloned().collect(),
            RoleSpec::Concrete(_) => self
                .roles_by_node
                .iter()
                .filter(|(_, node_roles)| roles.matches_roles(node_roles))
                .map(|(id, _)| id.clone())
                .collect(),
        };
        sort_node_ids(&mut resolved);

        if policy == ResolvePolicy::Any {
            resolved.truncate(1);
        }

        trace!(roles = %roles, ?policy, nodes = ?resolved, "resolved roles");
        Ok(resolved)
    }
}

/// Node order: numeric ids ascending by value, then other ids lexicographically.
pub fn compare_node_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

pub fn sort_node_ids(ids: &mut [NodeId]) {
    ids.sort_by(|a, b| compare_node_ids(a, b));
}
