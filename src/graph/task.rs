// src/graph/task.rs

//! Task catalogue data model.
//!
//! These types mirror the task descriptions consumed from the deployment
//! graph catalogue (and from plugins), e.g.:
//!
//! ```toml
//! [[graph.default.task]]
//! id = "netconfig"
//! type = "puppet"
//! version = "2.0.0"
//! roles = ["controller", "compute"]
//! requires = ["hiera"]
//! cross_depends = [{ name = "database", role = ["controller"], policy = "any" }]
//! parameters = { puppet_manifest = "netconfig.pp", timeout = 300 }
//! condition = "changed(node.network)"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use regex::Regex;
use semver::Version;
use serde::de::{self, Deserializer};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::types::{ExecutionStrategy, ResolvePolicy};

pub type TaskId = String;
pub type NodeId = String;

/// Key of a per-node section in the serialized graph.
///
/// `None` is the sync node: stage markers, no-node placeholders and
/// cluster-wide data live there.
pub type NodeKey = Option<NodeId>;

/// Identifier of the out-of-band master node.
pub const MASTER_NODE_ID: &str = "master";

/// Lowest task schema version that understands cross dependencies.
pub const CROSS_DEPENDENCY_VERSION: &str = "2.0.0";

/// Type tag of a task.
///
/// Unknown types are carried through verbatim in [`TaskKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskKind {
    Puppet,
    Shell,
    UploadFile,
    Sync,
    CopyFiles,
    Reboot,
    Skipped,
    Noop,
    Stage,
    Group,
    Other(String),
}

impl TaskKind {
    pub fn as_str(&self) -> &str {
        match self {
            TaskKind::Puppet => "puppet",
            TaskKind::Shell => "shell",
            TaskKind::UploadFile => "upload_file",
            TaskKind::Sync => "sync",
            TaskKind::CopyFiles => "copy_files",
            TaskKind::Reboot => "reboot",
            TaskKind::Skipped => "skipped",
            TaskKind::Noop => "noop",
            TaskKind::Stage => "stage",
            TaskKind::Group => "group",
            TaskKind::Other(s) => s.as_str(),
        }
    }

    /// Tasks that do no work on the node they are bound to.
    pub fn is_marker(&self) -> bool {
        matches!(
            self,
            TaskKind::Skipped | TaskKind::Noop | TaskKind::Stage | TaskKind::Group
        )
    }
}

impl From<String> for TaskKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "puppet" => TaskKind::Puppet,
            "shell" => TaskKind::Shell,
            "upload_file" => TaskKind::UploadFile,
            "sync" => TaskKind::Sync,
            "copy_files" => TaskKind::CopyFiles,
            "reboot" => TaskKind::Reboot,
            "skipped" => TaskKind::Skipped,
            "noop" => TaskKind::Noop,
            "stage" => TaskKind::Stage,
            "group" => TaskKind::Group,
            _ => TaskKind::Other(s),
        }
    }
}

impl From<&str> for TaskKind {
    fn from(s: &str) -> Self {
        TaskKind::from(s.to_string())
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A literal name or a `/regex/` pattern.
///
/// Used for role names in role specifications and for task names in
/// `requires` / `cross_depends` relations.
#[derive(Debug, Clone)]
pub enum NamePattern {
    Name(String),
    Pattern(Regex),
}

impl NamePattern {
    pub fn parse(s: &str) -> Result<Self, regex::Error> {
        match s.strip_prefix('/').and_then(|rest| rest.strip_suffix('/')) {
            Some(inner) => Ok(NamePattern::Pattern(Regex::new(inner)?)),
            None => Ok(NamePattern::Name(s.to_string())),
        }
    }

    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            NamePattern::Name(name) => name == candidate,
            NamePattern::Pattern(re) => re.is_match(candidate),
        }
    }

    /// Original textual form (`name` or `/regex/`).
    pub fn source(&self) -> String {
        match self {
            NamePattern::Name(name) => name.clone(),
            NamePattern::Pattern(re) => format!("/{}/", re.as_str()),
        }
    }
}

impl PartialEq for NamePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source() == other.source()
    }
}

impl Eq for NamePattern {}

/// Which nodes a task (or the target of a relation) is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleSpec {
    /// Nodes having any of the listed roles.
    Concrete(Vec<NamePattern>),
    /// Every node in scope (`"*"`).
    All,
    /// The master node (`"master"`).
    Master,
    /// The node the task instance itself is bound to (`"self"`).
    SelfRole,
}

pub const ALL_ROLES: &str = "*";
pub const MASTER_ROLE: &str = "master";
pub const SELF_ROLE: &str = "self";

impl RoleSpec {
    /// Parse the list form of a role specification.
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self, regex::Error> {
        if items.iter().any(|s| s.as_ref() == ALL_ROLES) {
            return Ok(RoleSpec::All);
        }
        if let [single] = items {
            match single.as_ref() {
                MASTER_ROLE => return Ok(RoleSpec::Master),
                SELF_ROLE => return Ok(RoleSpec::SelfRole),
                _ => {}
            }
        }
        let patterns = items
            .iter()
            .map(|s| NamePattern::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RoleSpec::Concrete(patterns))
    }

    /// Concrete role specification from literal role names.
    pub fn roles<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RoleSpec::Concrete(
            names
                .into_iter()
                .map(|n| NamePattern::Name(n.into()))
                .collect(),
        )
    }

    /// Whether a node with the given roles qualifies (concrete specs only).
    pub fn matches_roles(&self, roles: &BTreeSet<String>) -> bool {
        match self {
            RoleSpec::Concrete(patterns) => patterns
                .iter()
                .any(|p| roles.iter().any(|role| p.matches(role))),
            RoleSpec::All => true,
            RoleSpec::Master | RoleSpec::SelfRole => false,
        }
    }

    /// Union of two role specifications.
    pub fn merge(&self, other: &RoleSpec) -> RoleSpec {
        match (self, other) {
            (RoleSpec::All, _) | (_, RoleSpec::All) => RoleSpec::All,
            (RoleSpec::Concrete(a), RoleSpec::Concrete(b)) => {
                let mut merged = a.clone();
                for p in b {
                    if !merged.contains(p) {
                        merged.push(p.clone());
                    }
                }
                RoleSpec::Concrete(merged)
            }
            (a, b) if a == b => a.clone(),
            (a, b) => {
                warn!(left = %a, right = %b, "cannot merge role specifications; keeping the first");
                a.clone()
            }
        }
    }

    pub fn to_strings(&self) -> Vec<String> {
        match self {
            RoleSpec::Concrete(patterns) => patterns.iter().map(NamePattern::source).collect(),
            RoleSpec::All => vec![ALL_ROLES.to_string()],
            RoleSpec::Master => vec![MASTER_ROLE.to_string()],
            RoleSpec::SelfRole => vec![SELF_ROLE.to_string()],
        }
    }
}

impl fmt::Display for RoleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_strings().join(","))
    }
}

impl Serialize for RoleSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RoleSpec::Concrete(patterns) => {
                let mut seq = serializer.serialize_seq(Some(patterns.len()))?;
                for p in patterns {
                    seq.serialize_element(&p.source())?;
                }
                seq.end()
            }
            RoleSpec::All => serializer.serialize_str(ALL_ROLES),
            RoleSpec::Master => serializer.serialize_str(MASTER_ROLE),
            RoleSpec::SelfRole => serializer.serialize_str(SELF_ROLE),
        }
    }
}

impl<'de> Deserialize<'de> for RoleSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawRoles {
            One(String),
            Many(Vec<String>),
        }

        let items = match RawRoles::deserialize(deserializer)? {
            RawRoles::One(s) => vec![s],
            RawRoles::Many(v) => v,
        };
        RoleSpec::parse(&items).map_err(de::Error::custom)
    }
}

/// A dependency on (or of) a task that may live on other nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossDependency {
    /// Task id or `/regex/` over task ids.
    pub name: String,

    /// Nodes to look on; `None` means every node, the master and the sync node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<RoleSpec>,

    #[serde(default)]
    pub policy: ResolvePolicy,
}

impl CrossDependency {
    pub fn new(name: impl Into<String>, role: Option<RoleSpec>) -> Self {
        Self {
            name: name.into(),
            role,
            policy: ResolvePolicy::All,
        }
    }
}

/// One entry of a deployment task catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,

    #[serde(rename = "type")]
    pub kind: TaskKind,

    /// Task schema version; `>= 2.0.0` is cross-dependency capable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Nodes this task runs on. `None` for tasks that inherit from a group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<RoleSpec>,

    /// Same-node predecessors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<TaskId>,

    /// Same-node successors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_for: Vec<TaskId>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cross_depends: Vec<CrossDependency>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cross_depended_by: Vec<CrossDependency>,

    /// Passed to the executor verbatim.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,

    /// Boolean expression deciding whether the task runs on a node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Member task ids (group tasks only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskId>,

    /// Legacy group membership.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<TaskId>,

    #[serde(default)]
    pub strategy: ExecutionStrategy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_on_error: Option<bool>,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, kind: impl Into<TaskKind>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            version: None,
            roles: None,
            requires: Vec::new(),
            required_for: Vec::new(),
            cross_depends: Vec::new(),
            cross_depended_by: Vec::new(),
            parameters: BTreeMap::new(),
            condition: None,
            tasks: Vec::new(),
            groups: Vec::new(),
            strategy: ExecutionStrategy::Parallel,
            fail_on_error: None,
        }
    }

    /// Whether this task uses the explicit cross-dependency format.
    pub fn is_cross_dependency_capable(&self) -> bool {
        let minimal = Version::new(2, 0, 0);
        self.version
            .as_deref()
            .and_then(parse_version)
            .is_some_and(|v| v >= minimal)
    }

    pub fn has_cross_dependencies(&self) -> bool {
        !self.cross_depends.is_empty() || !self.cross_depended_by.is_empty()
    }

    pub fn fail_on_error(&self) -> bool {
        self.fail_on_error.unwrap_or(true)
    }
}

/// Parse a task version, accepting the short `2` / `2.0` forms.
pub fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim();
    if let Ok(v) = Version::parse(raw) {
        return Some(v);
    }
    let padded = match raw.matches('.').count() {
        0 => format!("{raw}.0.0"),
        1 => format!("{raw}.0"),
        _ => return None,
    };
    Version::parse(&padded).ok()
}

/// Legacy plugin task expressed relative to a deployment stage.
///
/// `stage` is `name`, `name/N` or `name/-N`; `N` is a sort weight inside
/// the stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginTask {
    #[serde(default)]
    pub id: Option<TaskId>,

    /// Name of the contributing plugin, used to build ids.
    #[serde(default)]
    pub plugin: Option<String>,

    #[serde(rename = "type")]
    pub kind: TaskKind,

    #[serde(default, alias = "role")]
    pub roles: Option<RoleSpec>,

    pub stage: String,

    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,

    #[serde(default)]
    pub fail_on_error: Option<bool>,
}

impl PluginTask {
    /// Split `stage` into the stage name and its sort weight.
    pub fn stage_and_weight(&self) -> (&str, f64) {
        match self.stage.split_once('/') {
            None => (self.stage.as_str(), 0.0),
            Some((stage, weight)) => match weight.trim().parse::<f64>() {
                Ok(w) if w.is_finite() => (stage, w),
                _ => {
                    warn!(
                        stage = %self.stage,
                        "plugin task has a non numeric stage weight; using 0"
                    );
                    (stage, 0.0)
                }
            },
        }
    }
}
