//! Suite execution: sequential step walk, failure policy, export
//! promotion.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use crate::bus::{EventContext, LogLevel};
use crate::report::{StepResult, StepStatus, SuiteResult, SuiteStatus};
use crate::scope::VariableScope;
use crate::suite::Suite;

use super::step::StepRunner;
use super::RunContext;

/// Drives one suite on one worker; steps are strictly sequential.
pub struct SuiteRunner {
    ctx: Arc<RunContext>,
}

impl SuiteRunner {
    /// Create a runner over the shared run context.
    #[must_use]
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    /// Execute the suite and freeze its result.
    pub async fn run(&self, suite: &Suite) -> SuiteResult {
        let started_at = Utc::now();
        self.ctx.bus.publish(
            LogLevel::Info,
            format!("Suite '{}' started", suite.suite_name),
            Some(&self.ctx.run_id),
            Some(EventContext::for_suite(&suite.node_id)),
        );

        let mut scope =
            VariableScope::new(Arc::clone(&self.ctx.env), Arc::clone(&self.ctx.globals));

        // Suite variables resolve against env + globals (and each other,
        // in declaration order) before step 0.
        for (name, raw) in &suite.variables {
            match self
                .ctx
                .interpolator
                .interpolate_value(raw, &scope, &self.ctx.options)
                .await
            {
                Ok(value) => scope.set_suite_var(name.clone(), value),
                Err(err) => {
                    self.ctx.bus.publish(
                        LogLevel::Error,
                        format!("Suite variable '{name}' failed to resolve: {err}"),
                        Some(&self.ctx.run_id),
                        Some(EventContext::for_suite(&suite.node_id).with_error(&err)),
                    );
                    let mut result = SuiteResult::from_steps(
                        &suite.node_id,
                        &suite.suite_name,
                        suite.priority,
                        SuiteStatus::Error,
                        started_at,
                        Vec::new(),
                    );
                    result.error = Some(err.to_string());
                    return result;
                }
            }
        }

        let runner = StepRunner::new(&self.ctx, suite);
        let mut steps_results: Vec<StepResult> = Vec::with_capacity(suite.steps.len());
        let mut halted = false;
        let mut cancelled = false;

        for step in &suite.steps {
            if halted {
                steps_results.push(StepResult::skipped(&step.name, "earlier step failed"));
                continue;
            }
            if cancelled || self.ctx.cancel.is_cancelled() {
                cancelled = true;
                steps_results.push(StepResult::skipped(&step.name, "cancelled"));
                continue;
            }

            debug!(suite = %suite.node_id, step = %step.name, "Running step");
            let result = runner.run(step, &mut scope, 0, &[]).await;

            match result.status {
                StepStatus::Cancelled => cancelled = true,
                StepStatus::Failure => {
                    let continues = step
                        .continue_on_failure
                        .or(suite.continue_on_failure)
                        .unwrap_or(self.ctx.default_continue_on_failure);
                    if !continues {
                        halted = true;
                    }
                }
                StepStatus::Success | StepStatus::Skipped => {}
            }
            steps_results.push(result);
        }

        let any_failed = steps_results
            .iter()
            .any(|r| r.status == StepStatus::Failure);
        let status = if cancelled {
            SuiteStatus::Cancelled
        } else if any_failed {
            SuiteStatus::Failure
        } else {
            SuiteStatus::Success
        };

        // Exports promote only when the suite succeeded.
        if status == SuiteStatus::Success {
            self.promote_exports(suite, &scope);
        }

        let result = SuiteResult::from_steps(
            &suite.node_id,
            &suite.suite_name,
            suite.priority,
            status,
            started_at,
            steps_results,
        );

        info!(
            suite = %suite.node_id,
            status = ?status,
            steps = result.steps_executed,
            failed = result.steps_failed,
            "Suite finished"
        );
        self.ctx.bus.publish(
            if any_failed { LogLevel::Warn } else { LogLevel::Info },
            format!("Suite '{}' finished", suite.suite_name),
            Some(&self.ctx.run_id),
            Some(EventContext::for_suite(&suite.node_id).with_metadata(json!({
                "status": status,
                "steps_executed": result.steps_executed,
                "steps_failed": result.steps_failed,
            }))),
        );

        result
    }

    fn promote_exports(&self, suite: &Suite, scope: &VariableScope) {
        for name in &suite.exports {
            let Some(value) = scope.get(name) else {
                self.ctx.bus.publish(
                    LogLevel::Warn,
                    format!(
                        "Export '{name}' declared by suite '{}' was never set",
                        suite.node_id
                    ),
                    Some(&self.ctx.run_id),
                    Some(EventContext::for_suite(&suite.node_id)),
                );
                continue;
            };
            if scope.export_global(&suite.node_id, name, value) {
                self.ctx.bus.publish(
                    LogLevel::Warn,
                    format!("Global export '{}.{name}' overwritten", suite.node_id),
                    Some(&self.ctx.run_id),
                    Some(EventContext::for_suite(&suite.node_id)),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LogBus;
    use crate::suite::{CallSpec, Step};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn suite_from_yaml(yaml: &str) -> Suite {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn context(suites: Vec<Suite>) -> Arc<RunContext> {
        Arc::new(RunContext::new(
            "run-suite-test",
            Arc::new(LogBus::new()),
            suites,
            std::collections::HashMap::new(),
        ))
    }

    #[tokio::test]
    async fn captures_flow_between_steps_and_exports_promote() {
        let suite = suite_from_yaml(
            r"
node_id: auth
suite_name: Auth
exports: [token]
variables:
  prefix: 'tok'
steps:
  - name: make-token
    capture:
      token: '{{prefix}}-123'
  - name: use-token
    capture:
      echoed: '{{token}}'
",
        );
        let ctx = context(vec![suite.clone()]);
        let result = SuiteRunner::new(Arc::clone(&ctx)).run(&suite).await;

        assert_eq!(result.status, SuiteStatus::Success);
        assert_eq!(result.steps_successful, 2);
        assert_eq!(
            result.steps_results[1].captured_variables["echoed"],
            json!("tok-123")
        );
        assert_eq!(ctx.globals.get("auth", "token"), Some(json!("tok-123")));
    }

    #[tokio::test]
    async fn failure_halts_following_steps_by_default() {
        let suite = suite_from_yaml(
            r#"
node_id: failing
suite_name: Failing
steps:
  - name: broken
    capture:
      x: "$require('fs')"
  - name: never-runs
    capture:
      y: 'value'
"#,
        );
        let ctx = context(vec![suite.clone()]);
        let result = SuiteRunner::new(ctx).run(&suite).await;

        assert_eq!(result.status, SuiteStatus::Failure);
        assert_eq!(result.steps_results[0].status, StepStatus::Failure);
        assert_eq!(result.steps_results[1].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn continue_on_failure_keeps_the_suite_walking() {
        let suite = suite_from_yaml(
            r#"
node_id: tolerant
suite_name: Tolerant
steps:
  - name: broken
    continue_on_failure: true
    capture:
      x: "$require('fs')"
  - name: still-runs
    capture:
      y: 'value'
"#,
        );
        let ctx = context(vec![suite.clone()]);
        let result = SuiteRunner::new(ctx).run(&suite).await;

        // The suite still reports failure, but the next step ran.
        assert_eq!(result.status, SuiteStatus::Failure);
        assert_eq!(result.steps_results[1].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn exports_are_not_promoted_on_failure() {
        let suite = suite_from_yaml(
            r#"
node_id: nope
suite_name: Nope
exports: [x]
steps:
  - name: broken
    capture:
      x: "$require('fs')"
"#,
        );
        let ctx = context(vec![suite.clone()]);
        let result = SuiteRunner::new(Arc::clone(&ctx)).run(&suite).await;

        assert_eq!(result.status, SuiteStatus::Failure);
        assert_eq!(ctx.globals.get("nope", "x"), None);
    }

    #[tokio::test]
    async fn cross_suite_call_by_node_id_runs_the_callee() {
        let helper = suite_from_yaml(
            r"
node_id: helper
suite_name: Helper
exports: [made]
steps:
  - name: produce
    capture:
      made: '$6 * 7'
",
        );
        let main = Suite {
            node_id: "main".to_string(),
            suite_name: "Main".to_string(),
            base_url: None,
            priority: crate::suite::Priority::Medium,
            depends_on: Vec::new(),
            variables: BTreeMap::new(),
            exports: Vec::new(),
            tags: Vec::new(),
            continue_on_failure: None,
            steps: vec![Step {
                name: "delegate".to_string(),
                call: Some(CallSpec {
                    target: "helper".to_string(),
                    with: BTreeMap::new(),
                    propagate: None,
                }),
                ..Step::default()
            }],
            source_path: None,
            discovery_index: 1,
        };

        let ctx = context(vec![helper, main.clone()]);
        let result = SuiteRunner::new(ctx).run(&main).await;

        assert_eq!(result.status, SuiteStatus::Success, "{:?}", result.steps_results[0].error);
        // helper's exports list selects what propagates back.
        assert_eq!(
            result.steps_results[0].captured_variables["made"],
            json!(42)
        );
    }
}
