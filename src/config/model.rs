// src/config/model.rs

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::graph::task::{PluginTask, TaskSpec};
use crate::inventory::{Cluster, Node, StaticInventory};

/// Scenario file as read from TOML, before validation.
///
/// ```toml
/// [config]
/// default_graph_type = "default"
/// dispatch_buffer = 16
///
/// [cluster]
/// id = 1
/// name = "lab"
/// settings = { release = "2024.1" }
///
/// [[node]]
/// id = "1"
/// roles = ["controller"]
/// status = "ready"
///
/// [[graph.default.task]]
/// id = "netconfig"
/// type = "puppet"
/// version = "2.0.0"
/// roles = "*"
///
/// [[plugin_task]]
/// plugin = "lbaas"
/// type = "shell"
/// role = ["controller"]
/// stage = "post_deployment/100"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub config: ConfigSection,

    pub cluster: Cluster,

    /// `[[node]]` entries.
    #[serde(default)]
    pub node: Vec<Node>,

    /// Task catalogues keyed by graph type (`[[graph.<type>.task]]`).
    #[serde(default)]
    pub graph: BTreeMap<String, GraphSection>,

    /// `[[plugin_task]]` entries; only used for the default graph type.
    #[serde(default)]
    pub plugin_task: Vec<PluginTask>,
}

/// `[config]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSection {
    /// Graph type deployed when none is requested.
    #[serde(default = "default_graph_type")]
    pub default_graph_type: String,

    /// Capacity of the executor message channel.
    #[serde(default = "default_dispatch_buffer")]
    pub dispatch_buffer: usize,
}

fn default_graph_type() -> String {
    crate::transaction::DEFAULT_GRAPH_TYPE.to_string()
}

fn default_dispatch_buffer() -> usize {
    16
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            default_graph_type: default_graph_type(),
            dispatch_buffer: default_dispatch_buffer(),
        }
    }
}

/// `[graph.<type>]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphSection {
    #[serde(default)]
    pub task: Vec<TaskSpec>,
}

/// Validated scenario. Only constructible through `TryFrom<RawConfigFile>`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub config: ConfigSection,
    pub cluster: Cluster,
    pub node: Vec<Node>,
    pub graph: BTreeMap<String, GraphSection>,
    pub plugin_task: Vec<PluginTask>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            config: raw.config,
            cluster: raw.cluster,
            node: raw.node,
            graph: raw.graph,
            plugin_task: raw.plugin_task,
        }
    }

    /// Task catalogue per graph type.
    pub fn catalogues(&self) -> BTreeMap<String, Vec<TaskSpec>> {
        self.graph
            .iter()
            .map(|(graph_type, section)| (graph_type.clone(), section.task.clone()))
            .collect()
    }

    /// Inventory holding the scenario's single cluster.
    pub fn inventory(&self) -> StaticInventory {
        StaticInventory::new().with_cluster(
            self.cluster.clone(),
            self.node.clone(),
            self.catalogues(),
            self.plugin_task.clone(),
        )
    }
}
