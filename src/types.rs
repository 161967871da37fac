use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How many of the nodes matching a role specification a relation needs.
///
/// - `All`: every matching node (default).
/// - `Any`: a single representative; the first matching node in node order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvePolicy {
    All,
    Any,
}

impl Default for ResolvePolicy {
    fn default() -> Self {
        ResolvePolicy::All
    }
}

impl FromStr for ResolvePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(ResolvePolicy::All),
            "any" => Ok(ResolvePolicy::Any),
            other => Err(format!(
                "invalid resolve policy: {other} (expected \"all\" or \"any\")"
            )),
        }
    }
}

/// Execution strategy of a task bound to several nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Instances on different nodes run independently.
    #[default]
    Parallel,
    /// Instances run strictly one after another, in node order.
    OneByOne,
}

/// Provisioning/deployment status of a node as reported by the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Freshly discovered, nothing applied yet.
    #[default]
    Discover,
    Provisioning,
    Provisioned,
    Deploying,
    Ready,
    Error,
    Stopped,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Discover => "discover",
            NodeStatus::Provisioning => "provisioning",
            NodeStatus::Provisioned => "provisioned",
            NodeStatus::Deploying => "deploying",
            NodeStatus::Ready => "ready",
            NodeStatus::Error => "error",
            NodeStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
