// src/lib.rs

pub mod cli;
pub mod config;
pub mod errors;
pub mod graph;
pub mod inventory;
pub mod logging;
pub mod transaction;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::inventory::DefaultSettingsSerializer;
use crate::transaction::{
    ChannelDispatcher, ExecuteRequest, ExecutionMessage, InMemoryStore, TransactionStatus,
    TransactionsManager,
};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - scenario loading
/// - inventory, settings serializer and transaction store
/// - the transactions manager
/// - a printer standing in for the executor (one JSON message per graph)
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;

    if args.check {
        print_check(&cfg);
        return Ok(());
    }

    let inventory = Arc::new(cfg.inventory());
    let store = Arc::new(InMemoryStore::new());

    // Executor channel: every batch is printed to stdout.
    let (tx, mut rx) = mpsc::channel::<Vec<ExecutionMessage>>(cfg.config.dispatch_buffer);
    let printer = tokio::spawn(async move {
        while let Some(batch) = rx.recv().await {
            for message in batch {
                match serde_json::to_string_pretty(&message) {
                    Ok(json) => println!("{json}"),
                    Err(e) => eprintln!("failed to encode execution message: {e}"),
                }
            }
        }
    });

    let mut manager = TransactionsManager::new(
        inventory,
        Arc::new(DefaultSettingsSerializer),
        store,
        ChannelDispatcher::new(tx),
    );

    let request = ExecuteRequest {
        cluster_id: cfg.cluster.id,
        nodes: (!args.nodes.is_empty()).then(|| args.nodes.clone()),
        graph_types: if args.graphs.is_empty() {
            vec![cfg.config.default_graph_type.clone()]
        } else {
            args.graphs.clone()
        },
        dry_run: args.dry_run,
        task_names: (!args.tasks.is_empty()).then(|| args.tasks.clone()),
        force: args.force,
    };

    let transaction = manager.execute(request).await?;
    for sub in transaction.subtransactions.iter() {
        if sub.status == TransactionStatus::Error {
            warn!(
                graph_type = %sub.graph_type,
                message = sub.message.as_deref().unwrap_or(""),
                "sub-transaction failed"
            );
        }
    }
    info!(
        transaction = %transaction.id,
        status = %transaction.status,
        subtransactions = transaction.subtransactions.len(),
        "deployment dispatched"
    );

    // Closing the channel lets the printer drain and exit.
    drop(manager);
    printer.await?;

    if transaction.status == TransactionStatus::Error {
        anyhow::bail!(
            "deployment failed: {}",
            transaction.message.as_deref().unwrap_or("no graph could be assembled")
        );
    }
    Ok(())
}

/// Validate-only output: print nodes and task catalogues.
fn print_check(cfg: &ConfigFile) {
    println!("deploygraph check");
    println!("  config.default_graph_type = {}", cfg.config.default_graph_type);
    println!("  config.dispatch_buffer = {}", cfg.config.dispatch_buffer);
    println!(
        "  cluster = {} ({})",
        cfg.cluster.id,
        cfg.cluster.name.as_deref().unwrap_or("unnamed")
    );
    println!();

    println!("nodes ({}):", cfg.node.len());
    for node in cfg.node.iter() {
        let roles: Vec<String> = node.effective_roles().into_iter().collect();
        println!("  - {} [{}] status={}", node.id, roles.join(", "), node.status);
        if node.pending_addition {
            println!("      pending_addition: true");
        }
        if node.pending_deletion {
            println!("      pending_deletion: true");
        }
    }
    println!();

    for (graph_type, section) in cfg.graph.iter() {
        println!("graph {graph_type} ({} tasks):", section.task.len());
        for task in section.task.iter() {
            println!("  - {} ({})", task.id, task.kind);
            if let Some(ref roles) = task.roles {
                println!("      roles: {roles}");
            }
            if !task.requires.is_empty() {
                println!("      requires: {:?}", task.requires);
            }
            if !task.required_for.is_empty() {
                println!("      required_for: {:?}", task.required_for);
            }
            for dep in task.cross_depends.iter() {
                println!(
                    "      cross_depends: {} @ {}",
                    dep.name,
                    dep.role.as_ref().map(|r| r.to_string()).unwrap_or_else(|| "any node".to_string())
                );
            }
            if let Some(ref condition) = task.condition {
                println!("      condition: {condition}");
            }
        }
    }

    if !cfg.plugin_task.is_empty() {
        println!();
        println!("plugin tasks ({}):", cfg.plugin_task.len());
        for task in cfg.plugin_task.iter() {
            println!(
                "  - {} ({}) stage={}",
                task.id.as_deref().unwrap_or("<generated>"),
                task.kind,
                task.stage
            );
        }
    }

    debug!("check complete (no execution)");
}
