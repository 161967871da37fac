// tests/config_errors.rs

use std::error::Error;
use std::io::Write;

use tempfile::NamedTempFile;

use deploygraph::config::load_and_validate;
use deploygraph::errors::DeployError;
use deploygraph::graph::TaskKind;
use deploygraph::inventory::ClusterSource;
use deploygraph::types::{ExecutionStrategy, NodeStatus, ResolvePolicy};

type TestResult = Result<(), Box<dyn Error>>;

fn scenario(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

const CLUSTER: &str = r#"
[cluster]
id = 7
name = "lab"
settings = { release = "2024.1" }
"#;

fn with_cluster(rest: &str) -> NamedTempFile {
    scenario(&format!("{CLUSTER}\n{rest}"))
}

#[test]
fn test_valid_scenario_loads() -> TestResult {
    let file = with_cluster(
        r#"
[config]
dispatch_buffer = 4

[[cluster.fault_tolerance_groups]]
name = "computes"
node_ids = ["2"]
fault_tolerance = 1

[[node]]
id = "1"
roles = ["controller"]
status = "ready"

[[node]]
id = "2"
pending_roles = ["compute"]
pending_addition = true

[[graph.default.task]]
id = "primary"
type = "group"
roles = ["controller"]
tasks = ["database"]

[[graph.default.task]]
id = "database"
type = "puppet"
version = "2.0.0"
requires = ["primary_start"]
strategy = "one_by_one"
parameters = { puppet_manifest = "database.pp", timeout = 600 }

[[graph.default.task]]
id = "nova"
type = "puppet"
version = "2.0"
roles = "compute"
cross_depends = [{ name = "database", role = ["controller"], policy = "any" }]
condition = "changed(node.roles)"

[[graph.maintenance.task]]
id = "restart"
type = "shell"
version = "2.0.0"
roles = "*"

[[plugin_task]]
plugin = "lbaas"
type = "shell"
role = ["controller"]
stage = "post_deployment/100"
"#,
    );

    let cfg = load_and_validate(file.path())?;

    assert_eq!(cfg.config.default_graph_type, "default");
    assert_eq!(cfg.config.dispatch_buffer, 4);
    assert_eq!(cfg.cluster.id, 7);
    assert_eq!(cfg.cluster.fault_tolerance_groups[0].fault_tolerance, 1);

    assert_eq!(cfg.node.len(), 2);
    assert_eq!(cfg.node[0].status, NodeStatus::Ready);
    assert_eq!(cfg.node[1].status, NodeStatus::Discover);
    assert!(cfg.node[1].needs_full_redeploy());

    let default = &cfg.graph["default"].task;
    assert_eq!(default[0].kind, TaskKind::Group);
    assert_eq!(default[1].strategy, ExecutionStrategy::OneByOne);
    assert!(default[2].is_cross_dependency_capable());
    assert_eq!(default[2].cross_depends[0].policy, ResolvePolicy::Any);
    assert!(!default[0].is_cross_dependency_capable());

    assert_eq!(cfg.plugin_task.len(), 1);
    assert_eq!(cfg.plugin_task[0].stage_and_weight(), ("post_deployment", 100.0));

    let inventory = cfg.inventory();
    assert_eq!(inventory.nodes(7)?.len(), 2);
    assert_eq!(inventory.deployment_tasks(7, "maintenance")?.len(), 1);
    assert_eq!(inventory.plugin_tasks(7)?.len(), 1);
    Ok(())
}

#[test]
fn test_requires_cycle_returns_structured_error() {
    let file = with_cluster(
        r#"
[[graph.default.task]]
id = "A"
type = "shell"
requires = ["B"]

[[graph.default.task]]
id = "B"
type = "shell"
requires = ["A"]
"#,
    );

    match load_and_validate(file.path()) {
        Err(DeployError::DagCycle(msg)) => {
            assert!(msg.contains("cycle detected"));
            assert!(msg.contains("default"));
            assert!(msg.contains("A") || msg.contains("B"));
        }
        Err(e) => panic!("Expected DagCycle error, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_required_for_cycle_is_detected() {
    let file = with_cluster(
        r#"
[[graph.default.task]]
id = "A"
type = "shell"
required_for = ["B"]

[[graph.default.task]]
id = "B"
type = "shell"
required_for = ["A"]
"#,
    );

    match load_and_validate(file.path()) {
        Err(DeployError::DagCycle(msg)) => assert!(msg.contains("cycle detected")),
        Err(e) => panic!("Expected DagCycle error, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_unknown_dependency_returns_config_error() {
    let file = with_cluster(
        r#"
[[graph.default.task]]
id = "A"
type = "shell"
requires = ["NonExistent"]
"#,
    );

    match load_and_validate(file.path()) {
        Err(DeployError::ConfigError(msg)) => {
            assert!(msg.contains("unknown dependency"));
            assert!(msg.contains("NonExistent"));
        }
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_pattern_requires_are_not_checked() -> TestResult {
    let file = with_cluster(
        r#"
[[graph.default.task]]
id = "A"
type = "shell"
requires = ["/^plugin_.*/"]
"#,
    );

    load_and_validate(file.path())?;
    Ok(())
}

#[test]
fn test_self_requirement_is_rejected() {
    let file = with_cluster(
        r#"
[[graph.default.task]]
id = "A"
type = "shell"
requires = ["A"]
"#,
    );

    match load_and_validate(file.path()) {
        Err(DeployError::ConfigError(msg)) => assert!(msg.contains("cannot require itself")),
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_duplicate_task_id_is_rejected() {
    let file = with_cluster(
        r#"
[[graph.default.task]]
id = "A"
type = "shell"

[[graph.default.task]]
id = "A"
type = "puppet"
"#,
    );

    match load_and_validate(file.path()) {
        Err(DeployError::ConfigError(msg)) => {
            assert!(msg.contains("duplicate task id"));
            assert!(msg.contains("'A'"));
        }
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_duplicate_node_id_is_rejected() {
    let file = with_cluster(
        r#"
[[node]]
id = "1"

[[node]]
id = "1"

[[graph.default.task]]
id = "A"
type = "shell"
"#,
    );

    match load_and_validate(file.path()) {
        Err(DeployError::ConfigError(msg)) => assert!(msg.contains("duplicate node id")),
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_master_node_id_is_reserved() {
    let file = with_cluster(
        r#"
[[node]]
id = "master"

[[graph.default.task]]
id = "A"
type = "shell"
"#,
    );

    match load_and_validate(file.path()) {
        Err(DeployError::ConfigError(msg)) => assert!(msg.contains("reserved")),
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_zero_dispatch_buffer_is_rejected() {
    let file = with_cluster(
        r#"
[config]
dispatch_buffer = 0

[[graph.default.task]]
id = "A"
type = "shell"
"#,
    );

    match load_and_validate(file.path()) {
        Err(DeployError::ConfigError(msg)) => assert!(msg.contains("dispatch_buffer")),
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_missing_default_graph_is_rejected() {
    let file = with_cluster(
        r#"
[config]
default_graph_type = "provision"

[[graph.default.task]]
id = "A"
type = "shell"
"#,
    );

    match load_and_validate(file.path()) {
        Err(DeployError::ConfigError(msg)) => assert!(msg.contains("provision")),
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_scenario_without_tasks_is_rejected() {
    let file = with_cluster("");

    match load_and_validate(file.path()) {
        Err(DeployError::ConfigError(msg)) => assert!(msg.contains("at least one")),
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_fault_tolerance_group_with_unknown_node() {
    let file = with_cluster(
        r#"
[[cluster.fault_tolerance_groups]]
name = "computes"
node_ids = ["5"]

[[graph.default.task]]
id = "A"
type = "shell"
"#,
    );

    match load_and_validate(file.path()) {
        Err(DeployError::ConfigError(msg)) => {
            assert!(msg.contains("computes"));
            assert!(msg.contains("'5'"));
        }
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_invalid_role_pattern_fails_to_parse() {
    let file = with_cluster(
        r#"
[[graph.default.task]]
id = "A"
type = "shell"
roles = ["/[unclosed/"]
"#,
    );

    match load_and_validate(file.path()) {
        Err(DeployError::TomlError(_)) => {}
        Err(e) => panic!("Expected TomlError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_missing_file_is_io_error() {
    match load_and_validate("/nonexistent/Deploygraph.toml") {
        Err(DeployError::IoError(_)) => {}
        Err(e) => panic!("Expected IoError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}
