// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `deploygraph`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "deploygraph",
    version,
    about = "Serialize role-based deployment graphs into per-node execution graphs.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the scenario file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Deploygraph.toml")]
    pub config: String,

    /// Graph type to deploy; repeat for several. Defaults to the
    /// `[config].default_graph_type`.
    #[arg(long = "graph", value_name = "TYPE")]
    pub graphs: Vec<String>,

    /// Restrict the deployment to this node id; repeatable.
    #[arg(long = "node", value_name = "ID")]
    pub nodes: Vec<String>,

    /// Run only this task; repeatable. Other tasks become placeholders.
    #[arg(long = "task", value_name = "NAME")]
    pub tasks: Vec<String>,

    /// Ignore previously applied state and run every task.
    #[arg(long)]
    pub force: bool,

    /// Mark the execution messages as dry run.
    #[arg(long)]
    pub dry_run: bool,

    /// Parse + validate and print the catalogue, don't build messages.
    #[arg(long)]
    pub check: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DEPLOYGRAPH_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
