// tests/manager_transactions.rs

use std::error::Error;
use std::sync::{Arc, Mutex};

use serde_json::json;

use deploygraph::errors::DeployError;
use deploygraph::graph::TaskKind;
use deploygraph::inventory::{DefaultSettingsSerializer, StaticInventory};
use deploygraph::transaction::{
    Dispatcher, ExecuteRequest, ExecutionMessage, HistoryStatus, InMemoryStore, NodeTaskReport,
    TaskUpdate, Transaction, TransactionStatus, TransactionStore, TransactionsManager,
};
use deploygraph::types::NodeStatus;
use deploygraph_test_utils::builders::{InventoryBuilder, NodeBuilder, TaskBuilder};
use deploygraph_test_utils::fake_dispatcher::{
    FailingDispatcher, InlineCompletingDispatcher, RecordingDispatcher,
};
use deploygraph_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

const CLUSTER: u64 = 1;

fn controller() -> NodeBuilder {
    NodeBuilder::new("1").roles(&["controller"])
}

fn compute() -> NodeBuilder {
    NodeBuilder::new("2").roles(&["compute"])
}

fn inventory() -> InventoryBuilder {
    InventoryBuilder::new(CLUSTER)
        .settings(json!({ "debug": false }))
        .node(controller().build())
        .node(compute().build())
        .graph(
            "default",
            vec![
                TaskBuilder::shell("hiera").roles(&["*"]).build(),
                TaskBuilder::puppet("netconfig")
                    .roles(&["*"])
                    .requires("hiera")
                    .build(),
                TaskBuilder::puppet("database").roles(&["controller"]).build(),
                TaskBuilder::puppet("nova")
                    .roles(&["compute"])
                    .cross_depends("database", Some(&["controller"]))
                    .build(),
            ],
        )
        .graph(
            "post",
            vec![TaskBuilder::shell("sanity").roles(&["*"]).build()],
        )
}

struct Harness<D: Dispatcher> {
    manager: TransactionsManager<D>,
    inventory: Arc<StaticInventory>,
    store: Arc<InMemoryStore>,
}

fn harness_with<D: Dispatcher>(builder: InventoryBuilder, dispatcher: D) -> Harness<D> {
    let inventory = Arc::new(builder.build());
    let store = Arc::new(InMemoryStore::new());
    let manager = TransactionsManager::new(
        inventory.clone(),
        Arc::new(DefaultSettingsSerializer),
        store.clone(),
        dispatcher,
    );
    Harness {
        manager,
        inventory,
        store,
    }
}

fn recording_harness(
    builder: InventoryBuilder,
) -> (Harness<RecordingDispatcher>, Arc<Mutex<Vec<ExecutionMessage>>>) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let harness = harness_with(builder, RecordingDispatcher::new(sent.clone()));
    (harness, sent)
}

/// Report every working instance of every assembled graph as ready.
fn complete<D: Dispatcher>(
    manager: &TransactionsManager<D>,
    transaction: &Transaction,
) -> Result<Transaction, DeployError> {
    let mut latest = transaction.clone();
    for sub in transaction.subtransactions.iter() {
        let Some(graph) = &sub.graph else {
            continue;
        };
        let mut update = TaskUpdate::new(sub.id);
        update.status = Some(TransactionStatus::Ready);
        update.nodes = graph
            .instances()
            .filter(|(_, task)| !task.kind.is_marker())
            .map(|(node, task)| NodeTaskReport {
                node_id: node.clone(),
                task: task.id.clone(),
                status: HistoryStatus::Ready,
            })
            .collect();
        latest = manager.process_update(update)?;
    }
    Ok(latest)
}

fn kind_on(transaction: &Transaction, node: &str, task: &str) -> Option<TaskKind> {
    transaction.subtransactions[0]
        .graph
        .as_ref()
        .and_then(|g| g.task(Some(node), task))
        .map(|t| t.kind.clone())
}

#[tokio::test]
async fn test_execute_dispatches_one_message_per_graph() -> TestResult {
    init_tracing();
    let (mut h, sent) = recording_harness(inventory());

    let mut request = ExecuteRequest::new(CLUSTER);
    request.graph_types = vec!["default".to_string(), "post".to_string()];
    let tx = with_timeout(h.manager.execute(request)).await?;

    assert_eq!(tx.status, TransactionStatus::Running);
    assert_eq!(tx.subtransactions.len(), 2);
    assert!(tx.subtransactions.iter().all(|s| s.status == TransactionStatus::Running));

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    let sub_ids: Vec<_> = tx.subtransactions.iter().map(|s| s.id).collect();
    let sent_ids: Vec<_> = sent.iter().map(|m| m.task_uuid).collect();
    assert_eq!(sent_ids, sub_ids);
    assert!(sent[0].tasks_directory.contains_key("nova"));
    assert!(sent[1].tasks_directory.contains_key("sanity"));
    assert!(!sent[1].tasks_directory.contains_key("nova"));

    let stored = h.store.get(tx.id)?;
    assert_eq!(stored.status, TransactionStatus::Running);
    Ok(())
}

#[tokio::test]
async fn test_history_is_seeded_and_updated() -> TestResult {
    init_tracing();
    let (mut h, _sent) = recording_harness(inventory());

    let tx = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;
    let sub = &tx.subtransactions[0];
    assert_eq!(
        sub.history["database"].get(&Some("1".to_string())),
        Some(&HistoryStatus::Pending)
    );

    let mut update = TaskUpdate::new(sub.id);
    update.progress = Some(40);
    update.nodes.push(NodeTaskReport {
        node_id: Some("1".to_string()),
        task: "database".to_string(),
        status: HistoryStatus::Ready,
    });
    let tx = h.manager.process_update(update)?;

    let sub = &tx.subtransactions[0];
    assert_eq!(
        sub.history["database"].get(&Some("1".to_string())),
        Some(&HistoryStatus::Ready)
    );
    assert_eq!(sub.progress, 40);
    assert_eq!(tx.status, TransactionStatus::Running);
    assert_eq!(tx.progress, 40);

    let applied = h.store.applied_state(CLUSTER)?;
    assert!(applied["database"].contains_key(&Some("1".to_string())));
    assert!(!applied.contains_key("nova"));
    Ok(())
}

#[tokio::test]
async fn test_rerun_without_changes_is_noop() -> TestResult {
    init_tracing();
    let (mut h, _sent) = recording_harness(inventory());

    let first = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;
    let finished = complete(&h.manager, &first)?;
    assert_eq!(finished.status, TransactionStatus::Ready);
    assert_eq!(finished.progress, 100);
    assert!(finished.finished_at.is_some());

    let second = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;
    let graph = second.subtransactions[0]
        .graph
        .as_ref()
        .ok_or("graph missing")?;
    assert!(graph.is_noop());
    assert_eq!(kind_on(&second, "1", "database"), Some(TaskKind::Skipped));

    // The finished deployment was discarded.
    assert_eq!(h.store.transactions(CLUSTER).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_force_ignores_applied_state() -> TestResult {
    init_tracing();
    let (mut h, _sent) = recording_harness(inventory());

    let first = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;
    complete(&h.manager, &first)?;

    let mut request = ExecuteRequest::new(CLUSTER);
    request.force = true;
    let forced = h.manager.execute(request).await?;

    assert_eq!(kind_on(&forced, "1", "database"), Some(TaskKind::Puppet));
    assert_eq!(kind_on(&forced, "2", "nova"), Some(TaskKind::Puppet));
    assert_eq!(kind_on(&forced, "2", "hiera"), Some(TaskKind::Shell));
    Ok(())
}

#[tokio::test]
async fn test_settings_change_redeploys_everything() -> TestResult {
    init_tracing();
    let (mut h, _sent) = recording_harness(inventory());

    let first = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;
    complete(&h.manager, &first)?;

    h.inventory.set_settings(CLUSTER, json!({ "debug": true }))?;
    let second = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;

    assert_eq!(kind_on(&second, "1", "netconfig"), Some(TaskKind::Puppet));
    assert_eq!(kind_on(&second, "2", "netconfig"), Some(TaskKind::Puppet));
    Ok(())
}

#[tokio::test]
async fn test_rediscovered_node_is_deployed_from_scratch() -> TestResult {
    init_tracing();
    let (mut h, _sent) = recording_harness(inventory());

    let first = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;
    complete(&h.manager, &first)?;

    h.inventory.set_nodes(
        CLUSTER,
        vec![
            controller().build(),
            compute().status(NodeStatus::Discover).build(),
        ],
    )?;
    let second = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;

    assert_eq!(kind_on(&second, "1", "hiera"), Some(TaskKind::Skipped));
    assert_eq!(kind_on(&second, "2", "hiera"), Some(TaskKind::Shell));
    assert_eq!(kind_on(&second, "2", "nova"), Some(TaskKind::Puppet));
    Ok(())
}

#[tokio::test]
async fn test_pending_roles_take_part_in_deployment() -> TestResult {
    init_tracing();
    let builder = inventory().node(NodeBuilder::new("3").pending_roles(&["compute"]).pending_addition().build());
    let (mut h, _sent) = recording_harness(builder);

    let tx = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;

    assert_eq!(kind_on(&tx, "3", "nova"), Some(TaskKind::Puppet));
    let graph = tx.subtransactions[0].graph.as_ref().ok_or("graph missing")?;
    let nova = graph.task(Some("3"), "nova").ok_or("nova missing on node 3")?;
    assert_eq!(nova.requires.len(), 1);
    assert_eq!(nova.requires[0].node_id.as_deref(), Some("1"));
    Ok(())
}

#[tokio::test]
async fn test_second_deployment_is_rejected_while_active() -> TestResult {
    init_tracing();
    let (mut h, _sent) = recording_harness(inventory());

    let first = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;

    match h.manager.execute(ExecuteRequest::new(CLUSTER)).await {
        Err(DeployError::DeploymentAlreadyStarted {
            cluster_id,
            transaction_id,
        }) => {
            assert_eq!(cluster_id, CLUSTER);
            assert_eq!(transaction_id, first.id);
        }
        Err(e) => panic!("Expected DeploymentAlreadyStarted, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
    assert_eq!(h.store.transactions(CLUSTER).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_locked_cluster_is_rejected() -> TestResult {
    init_tracing();
    let (mut h, sent) = recording_harness(inventory());

    let lock = h.store.try_lock_cluster(CLUSTER)?;
    match h.manager.execute(ExecuteRequest::new(CLUSTER)).await {
        Err(DeployError::ClusterLocked(id)) => assert_eq!(id, CLUSTER),
        Err(e) => panic!("Expected ClusterLocked, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
    assert!(h.store.transactions(CLUSTER).is_empty());
    assert!(sent.lock().unwrap().is_empty());

    drop(lock);
    let tx = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;
    assert_eq!(tx.status, TransactionStatus::Running);
    Ok(())
}

#[tokio::test]
async fn test_unknown_graph_type_fails_only_its_subtransaction() -> TestResult {
    init_tracing();
    let (mut h, sent) = recording_harness(inventory());

    let mut request = ExecuteRequest::new(CLUSTER);
    request.graph_types = vec!["default".to_string(), "missing".to_string()];
    let tx = h.manager.execute(request).await?;

    assert_eq!(tx.status, TransactionStatus::Running);
    assert_eq!(tx.subtransactions[0].status, TransactionStatus::Running);
    let missing = &tx.subtransactions[1];
    assert_eq!(missing.status, TransactionStatus::Error);
    assert!(!missing.assembled);
    assert!(missing.message.as_deref().unwrap_or("").contains("missing"));
    assert_eq!(sent.lock().unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_no_assembled_graph_fails_the_transaction() -> TestResult {
    init_tracing();
    let (mut h, sent) = recording_harness(inventory());

    let mut request = ExecuteRequest::new(CLUSTER);
    request.graph_types = vec!["missing".to_string()];
    let tx = h.manager.execute(request).await?;

    assert_eq!(tx.status, TransactionStatus::Error);
    assert!(tx.finished_at.is_some());
    assert!(tx.message.as_deref().unwrap_or("").contains("unknown graph type"));
    assert!(sent.lock().unwrap().is_empty());

    // A failed deployment does not block the next one.
    let next = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;
    assert_eq!(next.status, TransactionStatus::Running);
    Ok(())
}

#[tokio::test]
async fn test_legacy_catalogue_is_fatal() -> TestResult {
    init_tracing();
    let builder = inventory().graph(
        "default",
        vec![TaskBuilder::shell("old").legacy().roles(&["*"]).build()],
    );
    let (mut h, _sent) = recording_harness(builder);

    match h.manager.execute(ExecuteRequest::new(CLUSTER)).await {
        Err(DeployError::LegacyTaskVersion { task, .. }) => assert_eq!(task, "old"),
        Err(e) => panic!("Expected LegacyTaskVersion, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
    assert!(h.store.transactions(CLUSTER).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_dry_run_records_no_applied_state() -> TestResult {
    init_tracing();
    let (mut h, sent) = recording_harness(inventory());

    let mut request = ExecuteRequest::new(CLUSTER);
    request.dry_run = true;
    let tx = h.manager.execute(request).await?;
    assert!(tx.dry_run);
    assert!(sent.lock().unwrap().iter().all(|m| m.dry_run));

    let finished = complete(&h.manager, &tx)?;
    assert_eq!(finished.status, TransactionStatus::Ready);
    assert!(h.store.applied_state(CLUSTER)?.is_empty());

    // Nothing was applied, so the next run deploys everything again.
    let next = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;
    assert_eq!(kind_on(&next, "1", "database"), Some(TaskKind::Puppet));
    Ok(())
}

#[tokio::test]
async fn test_failed_subtransaction_aborts_siblings() -> TestResult {
    init_tracing();
    let (mut h, _sent) = recording_harness(inventory());

    let mut request = ExecuteRequest::new(CLUSTER);
    request.graph_types = vec!["default".to_string(), "post".to_string()];
    let tx = h.manager.execute(request).await?;
    let (first, second) = (tx.subtransactions[0].id, tx.subtransactions[1].id);

    let mut progress = TaskUpdate::new(first);
    progress.progress = Some(50);
    let tx = h.manager.process_update(progress)?;
    assert_eq!(tx.status, TransactionStatus::Running);
    assert_eq!(tx.progress, 25);

    let mut failure = TaskUpdate::new(first);
    failure.status = Some(TransactionStatus::Error);
    failure.message = Some("puppet run failed on node 1".to_string());
    let tx = h.manager.process_update(failure)?;

    assert_eq!(tx.status, TransactionStatus::Error);
    assert_eq!(tx.message.as_deref(), Some("puppet run failed on node 1"));
    let sibling = tx.subtransaction(second).ok_or("sibling missing")?;
    assert_eq!(sibling.status, TransactionStatus::Error);
    assert_eq!(sibling.message.as_deref(), Some("aborted"));
    assert!(tx.finished_at.is_some());
    Ok(())
}

#[tokio::test]
async fn test_backward_transition_is_rejected() -> TestResult {
    init_tracing();
    let (mut h, _sent) = recording_harness(inventory());

    let tx = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;
    let sub_id = tx.subtransactions[0].id;

    let mut update = TaskUpdate::new(sub_id);
    update.status = Some(TransactionStatus::Pending);
    update.nodes.push(NodeTaskReport {
        node_id: Some("1".to_string()),
        task: "database".to_string(),
        status: HistoryStatus::Ready,
    });

    match h.manager.process_update(update) {
        Err(DeployError::InvalidTransition { from, to }) => {
            assert_eq!(from, TransactionStatus::Running);
            assert_eq!(to, TransactionStatus::Pending);
        }
        Err(e) => panic!("Expected InvalidTransition, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }

    // Rejected updates leave no trace.
    let stored = h.store.get(tx.id)?;
    assert_eq!(
        stored.subtransactions[0].history["database"].get(&Some("1".to_string())),
        Some(&HistoryStatus::Pending)
    );
    assert!(h.store.applied_state(CLUSTER)?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_update_for_unknown_subtransaction() {
    init_tracing();
    let (h, _sent) = recording_harness(inventory());

    let unknown = uuid::Uuid::new_v4();
    match h.manager.process_update(TaskUpdate::new(unknown)) {
        Err(DeployError::TransactionNotFound(id)) => assert_eq!(id, unknown),
        Err(e) => panic!("Expected TransactionNotFound, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[tokio::test]
async fn test_dispatch_failure_marks_subtransactions_failed() -> TestResult {
    init_tracing();
    let mut h = harness_with(inventory(), FailingDispatcher);

    let tx = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;

    assert_eq!(tx.status, TransactionStatus::Error);
    let sub = &tx.subtransactions[0];
    assert_eq!(sub.status, TransactionStatus::Error);
    assert!(sub.message.as_deref().unwrap_or("").contains("executor unavailable"));
    assert!(!h.store.get(tx.id)?.is_active());
    Ok(())
}

#[tokio::test]
async fn test_unknown_node_is_rejected() {
    init_tracing();
    let (mut h, _sent) = recording_harness(inventory());

    let mut request = ExecuteRequest::new(CLUSTER);
    request.nodes = Some(vec!["1".to_string(), "9".to_string()]);

    match h.manager.execute(request).await {
        Err(DeployError::NodeNotFound {
            cluster_id,
            node_id,
        }) => {
            assert_eq!(cluster_id, CLUSTER);
            assert_eq!(node_id, "9");
        }
        Err(e) => panic!("Expected NodeNotFound, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[tokio::test]
async fn test_unknown_cluster_is_rejected() {
    init_tracing();
    let (mut h, _sent) = recording_harness(inventory());

    match h.manager.execute(ExecuteRequest::new(42)).await {
        Err(DeployError::ClusterNotFound(id)) => assert_eq!(id, 42),
        Err(e) => panic!("Expected ClusterNotFound, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[tokio::test]
async fn test_node_subset_limits_the_graph() -> TestResult {
    init_tracing();
    let (mut h, _sent) = recording_harness(inventory());

    let mut request = ExecuteRequest::new(CLUSTER);
    request.nodes = Some(vec!["2".to_string()]);
    let tx = h.manager.execute(request).await?;

    let graph = tx.subtransactions[0].graph.as_ref().ok_or("graph missing")?;
    assert!(graph.tasks_on(Some("1")).is_empty());
    assert_eq!(kind_on(&tx, "2", "nova"), Some(TaskKind::Puppet));
    // The controller is out of scope, so nothing waits on it.
    let nova = graph.task(Some("2"), "nova").ok_or("nova missing")?;
    assert!(nova.requires.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_task_names_restrict_the_deployment() -> TestResult {
    init_tracing();
    let (mut h, _sent) = recording_harness(inventory());

    let first = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;
    complete(&h.manager, &first)?;

    let mut request = ExecuteRequest::new(CLUSTER);
    request.task_names = Some(vec!["netconfig".to_string()]);
    let tx = h.manager.execute(request).await?;

    // Named tasks run even though nothing changed.
    assert_eq!(kind_on(&tx, "1", "netconfig"), Some(TaskKind::Puppet));
    assert_eq!(kind_on(&tx, "1", "hiera"), Some(TaskKind::Skipped));
    assert_eq!(kind_on(&tx, "1", "database"), Some(TaskKind::Skipped));
    Ok(())
}

#[tokio::test]
async fn test_chain_reports_record_the_logical_task() -> TestResult {
    init_tracing();
    let builder = InventoryBuilder::new(CLUSTER)
        .node(NodeBuilder::new("1").roles(&["controller"]).build())
        .node(NodeBuilder::new("2").roles(&["controller"]).build())
        .graph(
            "default",
            vec![TaskBuilder::puppet("deploy").roles(&["controller"]).one_by_one().build()],
        );
    let (mut h, _sent) = recording_harness(builder);

    let first = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;
    assert!(kind_on(&first, "1", "deploy_start").is_some());
    complete(&h.manager, &first)?;

    let applied = h.store.applied_state(CLUSTER)?;
    let deploy = applied.get("deploy").ok_or("no applied state for deploy")?;
    assert!(deploy.contains_key(&Some("1".to_string())));
    assert!(deploy.contains_key(&Some("2".to_string())));
    assert!(!applied.contains_key("deploy_start"));

    let second = h.manager.execute(ExecuteRequest::new(CLUSTER)).await?;
    let graph = second.subtransactions[0].graph.as_ref().ok_or("graph missing")?;
    assert!(graph.is_noop());
    Ok(())
}

#[tokio::test]
async fn test_reports_arriving_during_dispatch_are_kept() -> TestResult {
    init_tracing();
    let inventory = Arc::new(inventory().build());
    let store = Arc::new(InMemoryStore::new());
    let completed = Arc::new(Mutex::new(Vec::new()));
    let mut manager = TransactionsManager::new(
        inventory,
        Arc::new(DefaultSettingsSerializer),
        store.clone(),
        InlineCompletingDispatcher::new(store.clone(), completed.clone()),
    );

    let mut request = ExecuteRequest::new(CLUSTER);
    request.graph_types = vec!["default".to_string(), "post".to_string()];
    let tx = with_timeout(manager.execute(request)).await?;

    assert_eq!(completed.lock().unwrap().len(), 2);
    assert!(tx.subtransactions.iter().all(|s| s.status == TransactionStatus::Ready));
    assert_eq!(tx.status, TransactionStatus::Ready);
    assert_eq!(store.get(tx.id)?.status, TransactionStatus::Ready);
    Ok(())
}
