//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Declarative API test engine - YAML suites, dependency-ordered
/// scheduling, live telemetry
#[derive(Parser, Debug)]
#[command(name = "flow-test")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML or JSON)
    #[arg(short, long, env = "FLOW_TEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "FLOW_TEST_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "FLOW_TEST_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Subcommand; defaults to `run`
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Engine subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Discover suites and execute the run
    Run {
        /// Worker pool size (1-16)
        #[arg(short, long, env = "FLOW_TEST_WORKERS")]
        workers: Option<usize>,

        /// Only run suites with one of these priorities
        #[arg(long = "filter-priority", value_name = "PRIORITY")]
        priorities: Vec<String>,

        /// Only run suites with these node ids
        #[arg(long = "filter-node", value_name = "NODE_ID")]
        node_ids: Vec<String>,

        /// Only run suites carrying one of these tags
        #[arg(long = "filter-tag", value_name = "TAG")]
        tags: Vec<String>,

        /// Report output directory
        #[arg(long, env = "FLOW_TEST_OUTPUT_DIR")]
        output_dir: Option<String>,

        /// Serve the SSE telemetry endpoint on this address during the run
        #[arg(long, value_name = "ADDR")]
        serve: Option<String>,

        /// Keep running suites after failures
        #[arg(long)]
        continue_on_failure: bool,
    },

    /// Discover suites and validate the dependency graph without running
    Validate,

    /// Print the execution plan (layers, priorities, dependencies)
    List,
}
