//! Run orchestration.
//!
//! Discovers suites, builds the dependency plan, then dispatches suites
//! onto a bounded worker pool: a suite becomes eligible once every
//! dependency finished successfully; downstream of a failure is skipped
//! with reason `upstream_failed`. A run-level timeout cancels in-flight
//! work cooperatively through the shared token.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::{EventContext, LogBus, LogLevel, SessionOptions, SessionStatus};
use crate::config::Config;
use crate::discovery::{self, graph};
use crate::executor::suite::SuiteRunner;
use crate::executor::RunContext;
use crate::report::{Reporter, RunResult, SuiteResult, SuiteStatus};
use crate::suite::{Priority, Suite};
use crate::Result;

/// Per-suite facts kept outside the run context for bookkeeping.
struct SuiteMeta {
    name: String,
    priority: Priority,
    step_names: Vec<String>,
}

/// Schedules suites and aggregates the run result.
pub struct Orchestrator {
    config: Config,
    bus: Arc<LogBus>,
}

impl Orchestrator {
    /// Create an orchestrator owning the engine's long-lived services.
    #[must_use]
    pub fn new(config: Config, bus: Arc<LogBus>) -> Self {
        Self { config, bus }
    }

    /// Discovery + filtering + plan validation, shared by `run`,
    /// `validate` and `list`.
    ///
    /// # Errors
    ///
    /// Discovery, parse, unknown-dependency and cycle errors.
    pub fn prepare(&self) -> Result<(Vec<Suite>, graph::ExecutionPlan)> {
        let suites = discovery::discover(&self.config.roots())?;
        let filtered = self.apply_filters(suites);
        let plan = graph::build_plan(&filtered)?;
        Ok((filtered, plan))
    }

    fn apply_filters(&self, suites: Vec<Suite>) -> Vec<Suite> {
        let filters = &self.config.filters;
        if filters.is_empty() {
            return suites;
        }
        suites
            .into_iter()
            .filter(|suite| {
                (filters.node_ids.is_empty() || filters.node_ids.contains(&suite.node_id))
                    && (filters.priorities.is_empty()
                        || filters.priorities.contains(&suite.priority))
                    && (filters.tags.is_empty()
                        || suite.tags.iter().any(|tag| filters.tags.contains(tag)))
            })
            .collect()
    }

    /// Execute the whole run.
    ///
    /// Test failures are reported in the result, not as errors; `Err` is
    /// reserved for configuration/discovery problems and report IO.
    pub async fn run(&self) -> Result<RunResult> {
        let started_at = Utc::now();
        let (suites, plan) = self.prepare()?;
        let run_id = format!("run-{}", Uuid::new_v4());
        let env: HashMap<String, String> = std::env::vars().collect();

        let surfaced_env: HashMap<&String, &String> = env
            .iter()
            .filter(|(key, _)| key.starts_with("FLOW_TEST_"))
            .collect();
        let session = self.bus.begin_session(SessionOptions {
            run_id: run_id.clone(),
            label: self.config.project_name.0.clone(),
            source: "engine".to_string(),
            metadata: json!({
                "suites": suites.len(),
                "workers": self.config.worker_count(),
                "env": surfaced_env,
            }),
        });

        let metas: HashMap<String, SuiteMeta> = suites
            .iter()
            .map(|suite| {
                (
                    suite.node_id.clone(),
                    SuiteMeta {
                        name: suite.suite_name.clone(),
                        priority: suite.priority,
                        step_names: suite.steps.iter().map(|s| s.name.clone()).collect(),
                    },
                )
            })
            .collect();

        let ctx = Arc::new(
            RunContext::new(run_id.clone(), Arc::clone(&self.bus), suites, env)
                .with_strict_vars(self.config.strict_vars)
                .with_continue_on_failure(self.config.continue_on_failure),
        );

        info!(run_id = %run_id, suites = plan.order.len(), "Run started");
        self.bus.publish(
            LogLevel::Info,
            format!("Run started with {} suites", plan.order.len()),
            Some(&run_id),
            None,
        );

        let completed = self.schedule(&ctx, &plan, &metas).await;

        let ordered: Vec<SuiteResult> = {
            let mut completed = completed;
            plan.order
                .iter()
                .filter_map(|id| completed.remove(id))
                .collect()
        };
        let result = RunResult::aggregate(
            &self.config.project_name.0,
            &run_id,
            started_at,
            ordered,
        );

        self.bus.publish(
            if result.all_passed() {
                LogLevel::Info
            } else {
                LogLevel::Error
            },
            format!(
                "Run finished: {}/{} tests passed",
                result.successful_tests, result.total_tests
            ),
            Some(&run_id),
            Some(EventContext::default().with_metadata(json!({
                "total_tests": result.total_tests,
                "successful_tests": result.successful_tests,
                "failed_tests": result.failed_tests,
                "skipped_tests": result.skipped_tests,
                "success_rate": result.success_rate,
            }))),
        );

        if self.config.reporting.enabled {
            let reporter = Reporter::new(&self.config.reporting.output_dir);
            if let Err(err) = reporter.write(&result) {
                warn!(error = %err, "Failed to write report");
            }
        }

        let session_status = if result.any_cancelled() {
            SessionStatus::Cancelled
        } else if result.all_passed() {
            SessionStatus::Success
        } else {
            SessionStatus::Failure
        };
        session.end(
            session_status,
            Some(json!({
                "total_tests": result.total_tests,
                "failed_tests": result.failed_tests,
            })),
        );

        Ok(result)
    }

    /// The dispatch loop: spawn eligible suites up to the worker bound,
    /// cascade skips from failures, honor the run deadline.
    async fn schedule(
        &self,
        ctx: &Arc<RunContext>,
        plan: &graph::ExecutionPlan,
        metas: &HashMap<String, SuiteMeta>,
    ) -> HashMap<String, SuiteResult> {
        let workers = self.config.worker_count();
        let far_future = Duration::from_secs(60 * 60 * 24 * 365);
        let deadline =
            tokio::time::Instant::now() + self.config.timeouts.run.unwrap_or(far_future);

        let mut pending: Vec<String> = plan.order.clone();
        let mut running: HashSet<String> = HashSet::new();
        let mut finished: HashSet<String> = HashSet::new();
        let mut succeeded: HashSet<String> = HashSet::new();
        let mut completed: HashMap<String, SuiteResult> = HashMap::new();
        let mut join_set: JoinSet<(String, SuiteResult)> = JoinSet::new();
        let mut timed_out = false;

        loop {
            // Cascade: anything whose dependency finished unsuccessfully
            // is skipped, which may unblock further cascades.
            loop {
                let mut changed = false;
                pending.retain(|id| {
                    let blocked = plan.dependencies[id]
                        .iter()
                        .any(|dep| finished.contains(dep) && !succeeded.contains(dep));
                    if blocked {
                        let meta = &metas[id];
                        warn!(suite = %id, "Skipping suite: upstream failed");
                        self.bus.publish(
                            LogLevel::Warn,
                            format!("Suite '{id}' skipped (upstream_failed)"),
                            Some(&ctx.run_id),
                            Some(EventContext::for_suite(id)),
                        );
                        completed.insert(
                            id.clone(),
                            SuiteResult::skipped(
                                id,
                                &meta.name,
                                meta.priority,
                                &meta.step_names,
                                "upstream_failed",
                            ),
                        );
                        finished.insert(id.clone());
                        changed = true;
                    }
                    !blocked
                });
                if !changed {
                    break;
                }
            }

            // Dispatch eligible suites while capacity remains.
            if !timed_out {
                let eligible: Vec<String> = pending
                    .iter()
                    .filter(|id| {
                        plan.dependencies[id.as_str()]
                            .iter()
                            .all(|dep| succeeded.contains(dep))
                    })
                    .cloned()
                    .collect();
                for id in eligible {
                    if running.len() >= workers {
                        break;
                    }
                    pending.retain(|p| p != &id);
                    running.insert(id.clone());

                    let ctx = Arc::clone(ctx);
                    let suite = ctx.suite(&id).expect("suite registered in run context");
                    let suite_timeout = self.config.timeouts.suite;
                    join_set.spawn(async move {
                        let runner = SuiteRunner::new(Arc::clone(&ctx));
                        let result = match suite_timeout {
                            Some(limit) => {
                                match tokio::time::timeout(limit, runner.run(&suite)).await {
                                    Ok(result) => result,
                                    Err(_) => {
                                        let mut result = SuiteResult::from_steps(
                                            &suite.node_id,
                                            &suite.suite_name,
                                            suite.priority,
                                            SuiteStatus::Cancelled,
                                            Utc::now(),
                                            Vec::new(),
                                        );
                                        result.error =
                                            Some(format!("suite exceeded {limit:?}"));
                                        result
                                    }
                                }
                            }
                            None => runner.run(&suite).await,
                        };
                        (suite.node_id.clone(), result)
                    });
                }
            }

            if join_set.is_empty() {
                if pending.is_empty() || timed_out {
                    break;
                }
                // Nothing running, nothing eligible, nothing cascaded:
                // cannot happen in a validated DAG, but never hang.
                error!(remaining = pending.len(), "Scheduler made no progress");
                for id in pending.drain(..) {
                    let meta = &metas[&id];
                    completed.insert(
                        id.clone(),
                        SuiteResult::skipped(
                            &id,
                            &meta.name,
                            meta.priority,
                            &meta.step_names,
                            "unschedulable",
                        ),
                    );
                }
                break;
            }

            tokio::select! {
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok((id, result))) => {
                            running.remove(&id);
                            finished.insert(id.clone());
                            if result.status == SuiteStatus::Success {
                                succeeded.insert(id.clone());
                            }
                            completed.insert(id, result);
                        }
                        Some(Err(join_err)) => {
                            error!(error = %join_err, "Suite worker task failed");
                        }
                        None => {}
                    }
                }
                () = tokio::time::sleep_until(deadline), if !timed_out => {
                    warn!("Run timeout reached; cancelling in-flight suites");
                    self.bus.publish(
                        LogLevel::Warn,
                        "Run timeout reached",
                        Some(&ctx.run_id),
                        None,
                    );
                    timed_out = true;
                    ctx.cancel.cancel();
                }
            }
        }

        // Suites never dispatched because the run timed out.
        for id in pending.drain(..) {
            let meta = &metas[&id];
            let mut result = SuiteResult::skipped(
                &id,
                &meta.name,
                meta.priority,
                &meta.step_names,
                "run timeout",
            );
            result.status = SuiteStatus::Cancelled;
            completed.insert(id, result);
        }

        completed
    }
}
