//! flow-test - declarative API test engine CLI entry point.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use flow_test_engine::bus::LogBus;
use flow_test_engine::cli::{Cli, Commands};
use flow_test_engine::config::{Config, Workers};
use flow_test_engine::error::exit_codes;
use flow_test_engine::orchestrator::Orchestrator;
use flow_test_engine::suite::Priority;
use flow_test_engine::{setup_tracing, stream, Error};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::from(exit_codes::INTERNAL_ERROR);
    }

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::from(exit_codes::CONFIG_ERROR);
        }
    };

    match cli.command {
        None => run(config).await,
        Some(Commands::Run {
            workers,
            priorities,
            node_ids,
            tags,
            output_dir,
            serve,
            continue_on_failure,
        }) => {
            if let Some(workers) = workers {
                config.workers = Workers(workers);
            }
            match parse_priorities(&priorities) {
                Ok(parsed) => config.filters.priorities.extend(parsed),
                Err(bad) => {
                    error!("Unknown priority filter: {bad}");
                    return ExitCode::from(exit_codes::CONFIG_ERROR);
                }
            }
            config.filters.node_ids.extend(node_ids);
            config.filters.tags.extend(tags);
            if let Some(output_dir) = output_dir {
                config.reporting.output_dir = output_dir;
            }
            if let Some(addr) = serve {
                config.streaming.enabled = true;
                config.streaming.addr = addr;
            }
            if continue_on_failure {
                config.continue_on_failure = true;
            }
            run(config).await
        }
        Some(Commands::Validate) => validate(&config),
        Some(Commands::List) => list(&config),
    }
}

fn parse_priorities(raw: &[String]) -> Result<Vec<Priority>, String> {
    raw.iter()
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(other.to_string()),
        })
        .collect()
}

async fn run(config: Config) -> ExitCode {
    let bus = Arc::new(LogBus::new());

    // Optional telemetry endpoint alongside the run.
    let serve_cancel = CancellationToken::new();
    let server = if config.streaming.enabled {
        let addr = config.streaming.addr.clone();
        let bus = Arc::clone(&bus);
        let cancel = serve_cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = stream::serve(&addr, bus, cancel).await {
                error!("Telemetry endpoint error: {e}");
            }
        }))
    } else {
        None
    };

    let orchestrator = Orchestrator::new(config, bus);
    let outcome = orchestrator.run().await;

    serve_cancel.cancel();
    if let Some(server) = server {
        let _ = server.await;
    }

    match outcome {
        Ok(result) => {
            info!(
                total = result.total_tests,
                passed = result.successful_tests,
                failed = result.failed_tests,
                skipped = result.skipped_tests,
                "Run complete"
            );
            if result.any_cancelled() {
                ExitCode::from(exit_codes::CANCELLED)
            } else if result.all_passed() {
                ExitCode::from(exit_codes::SUCCESS)
            } else {
                ExitCode::from(exit_codes::TEST_FAILURE)
            }
        }
        Err(e) => {
            error!("Run failed: {e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(error: &Error) -> u8 {
    if error.is_setup_error() || matches!(error, Error::TargetNotFound(_)) {
        exit_codes::CONFIG_ERROR
    } else if matches!(error, Error::Cancelled | Error::Timeout(_)) {
        exit_codes::CANCELLED
    } else {
        exit_codes::INTERNAL_ERROR
    }
}

fn validate(config: &Config) -> ExitCode {
    let orchestrator = Orchestrator::new(config.clone(), Arc::new(LogBus::new()));
    match orchestrator.prepare() {
        Ok((suites, plan)) => {
            println!(
                "OK: {} suites, {} dependency layers",
                suites.len(),
                plan.layers.len()
            );
            ExitCode::from(exit_codes::SUCCESS)
        }
        Err(e) => {
            error!("Validation failed: {e}");
            ExitCode::from(exit_codes::CONFIG_ERROR)
        }
    }
}

fn list(config: &Config) -> ExitCode {
    let orchestrator = Orchestrator::new(config.clone(), Arc::new(LogBus::new()));
    match orchestrator.prepare() {
        Ok((suites, plan)) => {
            for (index, layer) in plan.layers.iter().enumerate() {
                println!("layer {index}:");
                for node_id in layer {
                    if let Some(suite) = suites.iter().find(|s| s.node_id == *node_id) {
                        println!(
                            "  {node_id}  [{:?}] {} step(s), depends_on: {:?}",
                            suite.priority,
                            suite.steps.len(),
                            suite.depends_on
                        );
                    }
                }
            }
            ExitCode::from(exit_codes::SUCCESS)
        }
        Err(e) => {
            error!("Discovery failed: {e}");
            ExitCode::from(exit_codes::CONFIG_ERROR)
        }
    }
}
