//! Step lifecycle state machine.
//!
//! ```text
//! Initial -> AwaitingInput -> Requesting -> Asserting -> Capturing -> Done
//!                        \-> Skipped (condition false)
//!                         \-> Failed (error; suite continues iff continue_on_failure)
//!                          \-> Retrying -> Requesting (up to retry.max_attempts)
//! ```
//!
//! `iterate` expands the step into N sub-executions sharing the parent
//! scope plus iteration-local `index`/`item`; the retry budget applies
//! per iteration. A cancellation token is checked before every action;
//! on cancel the step terminates as `cancelled` and post hooks run
//! best-effort within a two-second bound.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::assertion::AssertionResult;
use crate::bus::{EventContext, LogLevel};
use crate::capture::CaptureContext;
use crate::hooks::{CallDelegate, HookEnv, HookPoint, HookRunner, NoCalls};
use crate::http::HttpResponse;
use crate::interpolation::js_inputs_from_scope;
use crate::report::{ScenarioMeta, StepResult, StepStatus};
use crate::scope::VariableScope;
use crate::suite::{AssertSpec, CallSpec, RequestSpec, RetrySpec, Step, Suite};
use crate::{Error, Result};

use super::{call, RunContext};

/// Bound for best-effort post hooks after cancellation.
const CANCEL_HOOK_BUDGET: Duration = Duration::from_secs(2);

/// Lifecycle states a step execution moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    /// Entry; condition not yet evaluated
    Initial,
    /// Collecting input values
    AwaitingInput,
    /// Executing the primary action
    Requesting,
    /// Evaluating assertions
    Asserting,
    /// Evaluating captures
    Capturing,
    /// Terminal success
    Done,
    /// Terminal failure
    Failed,
    /// Terminal skip
    Skipped,
    /// Waiting out a retry backoff
    Retrying,
}

/// Mutable record of one attempt, kept so a failed attempt still
/// reports everything it produced.
#[derive(Default)]
struct AttemptRecord {
    request_details: Option<Value>,
    response: Option<HttpResponse>,
    call_result: Option<Value>,
    call_stack: Option<Vec<String>>,
    assertions: Vec<AssertionResult>,
    captured: BTreeMap<String, Value>,
    scenarios: Option<Vec<ScenarioMeta>>,
    assertion_failed: bool,
    capture_error: Option<String>,
}

/// Executes `call` hook actions with the step's nesting context.
struct StepCallDelegate<'a> {
    ctx: &'a RunContext,
    suite: &'a Suite,
    depth: usize,
    call_stack: &'a [String],
}

#[async_trait]
impl CallDelegate for StepCallDelegate<'_> {
    async fn call(&self, spec: &CallSpec, scope: &mut VariableScope) -> Result<Value> {
        let outcome =
            call::execute_call(self.ctx, self.suite, scope, spec, self.depth + 1, self.call_stack)
                .await?;
        for (name, value) in &outcome.propagated {
            scope.set_capture(name.clone(), value.clone());
        }
        Ok(outcome.result)
    }
}

/// Drives one step through its lifecycle.
pub struct StepRunner<'a> {
    ctx: &'a RunContext,
    suite: &'a Suite,
}

impl<'a> StepRunner<'a> {
    /// Create a runner bound to a suite.
    #[must_use]
    pub fn new(ctx: &'a RunContext, suite: &'a Suite) -> Self {
        Self { ctx, suite }
    }

    fn effective_continue_on_failure(&self, step: &Step) -> bool {
        // Step-level setting is authoritative; suite-level is only a
        // default for steps that leave it unset.
        step.continue_on_failure
            .or(self.suite.continue_on_failure)
            .unwrap_or(self.ctx.default_continue_on_failure)
    }

    /// Execute a step (including iteration expansion) against the
    /// suite-execution scope.
    pub async fn run(
        &self,
        step: &Step,
        scope: &mut VariableScope,
        depth: usize,
        call_stack: &[String],
    ) -> StepResult {
        debug!(step = %step.name, state = ?StepState::Initial, "Entering step");

        if self.ctx.cancel.is_cancelled() {
            return self.finalize_cancelled(step, Instant::now(), AttemptRecord::default(), 0);
        }

        if let Some(ref condition) = step.condition {
            match self.eval_bool_expr(condition, scope, None).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(step = %step.name, state = ?StepState::Skipped, "Condition false");
                    return StepResult::skipped(&step.name, "condition evaluated to false");
                }
                Err(err) => {
                    return self.finalize_error(step, Instant::now(), AttemptRecord::default(), 1, &err)
                }
            }
        }

        if step.iterate.is_some() {
            return self.run_iterations(step, scope, depth, call_stack).await;
        }

        self.run_lifecycle(step, scope, depth, call_stack).await
    }

    /// Expand `iterate` into sub-executions; each iteration is a fresh
    /// state machine with `index`/`item` bound in a pushed layer.
    #[allow(clippy::cast_possible_truncation)]
    async fn run_iterations(
        &self,
        step: &Step,
        scope: &mut VariableScope,
        depth: usize,
        call_stack: &[String],
    ) -> StepResult {
        let started = Instant::now();
        let iterate = step.iterate.as_ref().expect("checked by caller");

        let items: Vec<Value> = if let Some(count) = iterate.count {
            (0..count).map(|_| Value::Null).collect()
        } else if let Some(ref over) = iterate.over {
            match self.resolve_iteration_items(over, scope).await {
                Ok(items) => items,
                Err(err) => {
                    return self.finalize_error(step, started, AttemptRecord::default(), 1, &err)
                }
            }
        } else {
            Vec::new()
        };

        let mut iterations = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            if self.ctx.cancel.is_cancelled() {
                iterations.push(StepResult::skipped(
                    &format!("{}[{index}]", step.name),
                    "cancelled",
                ));
                continue;
            }

            scope.push_layer();
            scope.set_local("index", json!(index));
            scope.set_local("item", item);

            let pre = self
                .run_hooks(HookPoint::PreIteration, step, scope, None, depth, call_stack)
                .await;
            let mut result = match pre {
                Ok(()) => self.run_lifecycle(step, scope, depth, call_stack).await,
                Err(err) => self.finalize_error(step, Instant::now(), AttemptRecord::default(), 1, &err),
            };
            result.step_name = format!("{}[{index}]", step.name);

            if let Err(err) = self
                .run_hooks(HookPoint::PostIteration, step, scope, None, depth, call_stack)
                .await
            {
                if result.status == StepStatus::Success {
                    result.status = StepStatus::Failure;
                    result.error = Some(err.to_string());
                }
            }

            scope.pop_layer();
            iterations.push(result);
        }

        let status = if iterations
            .iter()
            .any(|r| matches!(r.status, StepStatus::Cancelled))
        {
            StepStatus::Cancelled
        } else if iterations
            .iter()
            .any(|r| r.status == StepStatus::Failure)
        {
            StepStatus::Failure
        } else {
            StepStatus::Success
        };

        let mut captured = BTreeMap::new();
        let mut assertions = Vec::new();
        for iteration in &iterations {
            captured.extend(iteration.captured_variables.clone());
            assertions.extend(iteration.assertions_results.clone());
        }

        StepResult {
            step_name: step.name.clone(),
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            request_details: None,
            response_details: None,
            assertions_results: assertions,
            captured_variables: captured,
            scenarios_meta: None,
            error: iterations.iter().find_map(|r| r.error.clone()),
            attempts: 1,
            iterations: Some(iterations),
            call_stack: None,
        }
    }

    /// Input phase plus the attempt loop of one state machine.
    async fn run_lifecycle(
        &self,
        step: &Step,
        scope: &mut VariableScope,
        depth: usize,
        call_stack: &[String],
    ) -> StepResult {
        let started = Instant::now();
        let retry = step.retry.clone().unwrap_or_default();
        let max_attempts = step.retry.as_ref().map_or(1, |r| r.max_attempts.max(1));

        scope.push_layer();
        let result = match step.timeout_ms {
            Some(budget_ms) => {
                let fut = self.lifecycle_inner(
                    step, scope, depth, call_stack, started, &retry, max_attempts,
                );
                match tokio::time::timeout(Duration::from_millis(budget_ms), fut).await {
                    Ok(result) => result,
                    Err(_) => {
                        let err = Error::Timeout(budget_ms);
                        self.finalize_error(step, started, AttemptRecord::default(), 1, &err)
                    }
                }
            }
            None => {
                self.lifecycle_inner(step, scope, depth, call_stack, started, &retry, max_attempts)
                    .await
            }
        };
        scope.pop_layer();
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn lifecycle_inner(
        &self,
        step: &Step,
        scope: &mut VariableScope,
        depth: usize,
        call_stack: &[String],
        started: Instant,
        retry: &RetrySpec,
        max_attempts: u32,
    ) -> StepResult {
        debug!(step = %step.name, state = ?StepState::AwaitingInput, "Collecting input");

        if let Err(err) = self
            .run_hooks(HookPoint::PreInput, step, scope, None, depth, call_stack)
            .await
        {
            return self.finalize_error(step, started, AttemptRecord::default(), 1, &err);
        }
        let input_values = match self.collect_input(step, scope).await {
            Ok(values) => values,
            Err(err) => {
                return self.finalize_error(step, started, AttemptRecord::default(), 1, &err)
            }
        };
        if let Err(err) = self
            .run_hooks(HookPoint::PostInput, step, scope, None, depth, call_stack)
            .await
        {
            return self.finalize_error(step, started, AttemptRecord::default(), 1, &err);
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.ctx.cancel.is_cancelled() {
                return self.finalize_cancelled(step, started, AttemptRecord::default(), attempt);
            }

            debug!(step = %step.name, attempt, state = ?StepState::Requesting, "Attempt starting");
            let mut record = AttemptRecord::default();
            let outcome = self
                .attempt(step, scope, depth, call_stack, input_values.as_ref(), &mut record)
                .await;

            match outcome {
                Ok(()) => {
                    let assertion_retryable =
                        record.assertion_failed && retry.on_assertion_failure;
                    if !record.assertion_failed && record.capture_error.is_none() {
                        return self.finalize_success(step, started, record, attempt);
                    }
                    if assertion_retryable
                        && record.capture_error.is_none()
                        && attempt < max_attempts
                    {
                        if self.backoff(step, retry, attempt).await.is_err() {
                            return self.finalize_cancelled(step, started, record, attempt);
                        }
                        continue;
                    }
                    return self.finalize_failed(step, started, record, attempt);
                }
                Err(Error::Cancelled) => {
                    self.best_effort_post_hooks(step, scope, &record).await;
                    return self.finalize_cancelled(step, started, record, attempt);
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    self.ctx.bus.publish(
                        LogLevel::Warn,
                        format!(
                            "Step '{}' attempt {attempt}/{max_attempts} failed: {err}",
                            step.name
                        ),
                        Some(&self.ctx.run_id),
                        Some(self.event_context(step).with_error(&err)),
                    );
                    if self.backoff(step, retry, attempt).await.is_err() {
                        return self.finalize_cancelled(step, started, record, attempt);
                    }
                    continue;
                }
                Err(err) => {
                    return self.finalize_error(step, started, record, attempt, &err);
                }
            }
        }
    }

    /// One pass through request -> scenarios -> assert -> capture.
    async fn attempt(
        &self,
        step: &Step,
        scope: &mut VariableScope,
        depth: usize,
        call_stack: &[String],
        input_values: Option<&Value>,
        record: &mut AttemptRecord,
    ) -> Result<()> {
        self.run_hooks(HookPoint::PreRequest, step, scope, None, depth, call_stack)
            .await?;
        if self.ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(ref request) = step.request {
            let resolved = self.resolve_request(request, scope).await?;
            let request_doc = request_to_value(&resolved);
            record.request_details = Some(request_doc.clone());
            scope.set_local("request", request_doc);

            let base_url = self.resolve_base_url(scope).await?;
            let response = self
                .ctx
                .invoker
                .execute(&resolved, base_url.as_deref(), &self.ctx.cancel)
                .await?;
            scope.set_local("response", response.to_value());
            record.response = Some(response);
        } else if let Some(ref call_spec) = step.call {
            let outcome = match call::execute_call(
                self.ctx,
                self.suite,
                scope,
                call_spec,
                depth + 1,
                call_stack,
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    // Keep the attempted chain visible in the result.
                    let mut chain: Vec<String> = call_stack.to_vec();
                    chain.push(call_spec.target.clone());
                    record.call_stack = Some(chain);
                    return Err(err);
                }
            };
            for (name, value) in &outcome.propagated {
                scope.set_capture(name.clone(), value.clone());
                record.captured.insert(name.clone(), value.clone());
            }
            scope.set_local("call_result", outcome.result.clone());
            record.call_result = Some(outcome.result);
            record.call_stack = Some(outcome.call_stack);
        }

        self.run_hooks(
            HookPoint::PostRequest,
            step,
            scope,
            record.response.as_ref(),
            depth,
            call_stack,
        )
        .await?;

        let (effective_assert, scenario_captures) =
            self.evaluate_scenarios(step, scope, record).await?;

        debug!(step = %step.name, state = ?StepState::Asserting, "Evaluating assertions");
        self.run_hooks(
            HookPoint::PreAssertion,
            step,
            scope,
            record.response.as_ref(),
            depth,
            call_stack,
        )
        .await?;

        if let Some(ref assert_spec) = effective_assert {
            let resolved = self.interpolate_assert(assert_spec, scope).await?;
            if let Some(ref response) = record.response {
                record.assertions = self.ctx.assertions.evaluate(&resolved, response);
            } else if !resolved.is_empty() {
                record.assertions = vec![AssertionResult::new(
                    "response",
                    "exists",
                    json!(true),
                    Value::Null,
                    false,
                )];
            }
            record.assertion_failed = record.assertions.iter().any(|r| !r.passed);
        }

        self.run_hooks(
            HookPoint::PostAssertion,
            step,
            scope,
            record.response.as_ref(),
            depth,
            call_stack,
        )
        .await?;

        // Captures run regardless of assertion outcome, unless the step
        // failed and won't continue.
        let continue_on_failure = self.effective_continue_on_failure(step);
        if record.assertion_failed && !continue_on_failure {
            debug!(step = %step.name, state = ?StepState::Failed, "Skipping captures after assertion failure");
            return Ok(());
        }

        debug!(step = %step.name, state = ?StepState::Capturing, "Evaluating captures");
        self.run_hooks(
            HookPoint::PreCapture,
            step,
            scope,
            record.response.as_ref(),
            depth,
            call_stack,
        )
        .await?;

        let mut captures = step.capture.clone().unwrap_or_default();
        captures.extend(scenario_captures);
        if !captures.is_empty() {
            let capture_ctx = CaptureContext {
                response: record.response.as_ref(),
                input: input_values,
                call_result: record.call_result.as_ref(),
                assertion_results: &record.assertions,
            };
            for (name, expr) in &captures {
                match self
                    .ctx
                    .captures
                    .capture(
                        name,
                        expr,
                        &capture_ctx,
                        scope,
                        &self.ctx.interpolator,
                        &self.ctx.sandbox,
                        &self.ctx.options,
                    )
                    .await
                {
                    Ok(value) => {
                        record.captured.insert(name.clone(), value.clone());
                    }
                    Err(err) => {
                        self.ctx.bus.publish(
                            LogLevel::Error,
                            err.to_string(),
                            Some(&self.ctx.run_id),
                            Some(self.event_context(step).with_error(&err)),
                        );
                        record.capture_error = Some(err.to_string());
                    }
                }
            }
            // Stored after evaluation so captures of one batch don't
            // observe each other mid-flight.
            for (name, value) in &record.captured {
                scope.set_capture(name.clone(), value.clone());
            }
        }

        self.run_hooks(
            HookPoint::PostCapture,
            step,
            scope,
            record.response.as_ref(),
            depth,
            call_stack,
        )
        .await?;

        Ok(())
    }

    /// Evaluate scenario conditions; the first match contributes its
    /// assertions and captures.
    async fn evaluate_scenarios(
        &self,
        step: &Step,
        scope: &VariableScope,
        record: &mut AttemptRecord,
    ) -> Result<(Option<AssertSpec>, BTreeMap<String, String>)> {
        let mut effective = step.assert.clone();
        let mut extra_captures = BTreeMap::new();
        if step.scenarios.is_empty() {
            return Ok((effective, extra_captures));
        }

        let mut metas = Vec::with_capacity(step.scenarios.len());
        let mut matched_any = false;
        for scenario in &step.scenarios {
            if matched_any {
                metas.push(ScenarioMeta {
                    name: scenario.name.clone(),
                    condition: scenario.condition.clone(),
                    matched: false,
                    executed: false,
                });
                continue;
            }

            let matched = self
                .eval_bool_expr(&scenario.condition, scope, record.response.as_ref())
                .await?;
            if matched {
                matched_any = true;
                if let Some(ref scenario_assert) = scenario.assert {
                    match effective {
                        Some(ref mut base) => base.merge(scenario_assert),
                        None => effective = Some(scenario_assert.clone()),
                    }
                }
                if let Some(ref captures) = scenario.capture {
                    extra_captures.extend(captures.clone());
                }
            }
            metas.push(ScenarioMeta {
                name: scenario.name.clone(),
                condition: scenario.condition.clone(),
                matched,
                executed: matched,
            });
        }

        record.scenarios = Some(metas);
        Ok((effective, extra_captures))
    }

    /// Collect input values: CI defaults in non-interactive mode;
    /// missing required inputs raise `InputError`.
    async fn collect_input(
        &self,
        step: &Step,
        scope: &mut VariableScope,
    ) -> Result<Option<Value>> {
        let Some(ref inputs) = step.input else {
            return Ok(None);
        };

        let mut values = serde_json::Map::new();
        for input in inputs {
            match input.ci_default {
                Some(ref raw) => {
                    let value = self
                        .ctx
                        .interpolator
                        .interpolate_value(raw, scope, &self.ctx.options)
                        .await?;
                    scope.set_local(input.name.clone(), value.clone());
                    values.insert(input.name.clone(), value);
                }
                None if input.required => {
                    return Err(Error::InputError(format!(
                        "Missing required input '{}' (no ci_default in non-interactive mode)",
                        input.name
                    )));
                }
                None => {}
            }
        }
        Ok(Some(Value::Object(values)))
    }

    /// Resolve every dynamic part of a request spec.
    async fn resolve_request(
        &self,
        request: &RequestSpec,
        scope: &VariableScope,
    ) -> Result<RequestSpec> {
        let interp = &self.ctx.interpolator;
        let options = &self.ctx.options;

        let mut resolved = request.clone();
        resolved.url = render_string(interp.interpolate_str(&request.url, scope, options).await?);
        resolved.method =
            render_string(interp.interpolate_str(&request.method, scope, options).await?);

        resolved.headers = BTreeMap::new();
        for (name, value) in &request.headers {
            resolved.headers.insert(
                name.clone(),
                render_string(interp.interpolate_str(value, scope, options).await?),
            );
        }

        resolved.query = BTreeMap::new();
        for (name, value) in &request.query {
            resolved
                .query
                .insert(name.clone(), interp.interpolate_value(value, scope, options).await?);
        }

        if let Some(ref body) = request.body {
            resolved.body = Some(interp.interpolate_value(body, scope, options).await?);
        }

        Ok(resolved)
    }

    async fn resolve_base_url(&self, scope: &VariableScope) -> Result<Option<String>> {
        let Some(ref raw) = self.suite.base_url else {
            return Ok(None);
        };
        let value = self
            .ctx
            .interpolator
            .interpolate_str(raw, scope, &self.ctx.options)
            .await?;
        Ok(Some(render_string(value)))
    }

    /// Interpolate an assert spec (check values may carry templates).
    async fn interpolate_assert(
        &self,
        spec: &AssertSpec,
        scope: &VariableScope,
    ) -> Result<AssertSpec> {
        let raw = serde_json::to_value(spec)?;
        let resolved = self
            .ctx
            .interpolator
            .interpolate_value(&raw, scope, &self.ctx.options)
            .await?;
        serde_json::from_value(resolved)
            .map_err(|e| Error::Config(format!("Assert spec invalid after interpolation: {e}")))
    }

    async fn resolve_iteration_items(
        &self,
        over: &str,
        scope: &VariableScope,
    ) -> Result<Vec<Value>> {
        let ctx = CaptureContext::default();
        let value = self
            .ctx
            .captures
            .capture(
                "iterate.over",
                over,
                &ctx,
                scope,
                &self.ctx.interpolator,
                &self.ctx.sandbox,
                &self.ctx.options,
            )
            .await
            .map_err(|e| match e {
                Error::CaptureFailed { source, .. } => *source,
                other => other,
            })?;
        match value {
            Value::Array(items) => Ok(items),
            other => Err(Error::Config(format!(
                "iterate.over must resolve to an array, got {}",
                render_string(other)
            ))),
        }
    }

    /// Evaluate a JS boolean expression (condition, scenario).
    async fn eval_bool_expr(
        &self,
        expr: &str,
        scope: &VariableScope,
        response: Option<&HttpResponse>,
    ) -> Result<bool> {
        let trimmed = expr.trim();
        let source = trimmed
            .strip_prefix("$js:")
            .unwrap_or_else(|| trimmed.trim_start_matches('$'))
            .trim();
        let code_block = source.starts_with("return") || source.contains(';');
        let mut inputs = js_inputs_from_scope(scope);
        if let Some(response) = response {
            inputs.response = Some(response.to_value());
        }
        self.ctx.sandbox.eval_bool(source, code_block, &inputs).await
    }

    async fn run_hooks(
        &self,
        point: HookPoint,
        step: &Step,
        scope: &mut VariableScope,
        response: Option<&HttpResponse>,
        depth: usize,
        call_stack: &[String],
    ) -> Result<()> {
        let Some(ref hooks) = step.hooks else {
            return Ok(());
        };
        let actions = hooks.at(point);
        if actions.is_empty() {
            return Ok(());
        }

        let env = HookEnv {
            interpolator: &self.ctx.interpolator,
            sandbox: &self.ctx.sandbox,
            captures: &self.ctx.captures,
            bus: &self.ctx.bus,
            run_id: &self.ctx.run_id,
            node_id: &self.suite.node_id,
            step_name: &step.name,
            response,
            cancel: &self.ctx.cancel,
            options: &self.ctx.options,
        };
        let delegate = StepCallDelegate {
            ctx: self.ctx,
            suite: self.suite,
            depth,
            call_stack,
        };
        HookRunner::new()
            .run_point(point, actions, scope, &env, &delegate)
            .await
    }

    /// After cancellation, give `post_request`/`post_capture` hooks a
    /// bounded chance to run with a detached token.
    async fn best_effort_post_hooks(
        &self,
        step: &Step,
        scope: &mut VariableScope,
        record: &AttemptRecord,
    ) {
        let Some(ref hooks) = step.hooks else { return };
        let detached = CancellationToken::new();
        let env = HookEnv {
            interpolator: &self.ctx.interpolator,
            sandbox: &self.ctx.sandbox,
            captures: &self.ctx.captures,
            bus: &self.ctx.bus,
            run_id: &self.ctx.run_id,
            node_id: &self.suite.node_id,
            step_name: &step.name,
            response: record.response.as_ref(),
            cancel: &detached,
            options: &self.ctx.options,
        };
        let runner = HookRunner::new();
        let work = async {
            for point in [HookPoint::PostRequest, HookPoint::PostCapture] {
                let actions = hooks.at(point);
                if !actions.is_empty() {
                    let _ = runner.run_point(point, actions, scope, &env, &NoCalls).await;
                }
            }
        };
        let _ = tokio::time::timeout(CANCEL_HOOK_BUDGET, work).await;
    }

    /// Cancellation-aware exponential backoff before the next attempt.
    async fn backoff(&self, step: &Step, retry: &RetrySpec, attempt: u32) -> Result<()> {
        let delay = retry.delay_before(attempt + 1);
        debug!(step = %step.name, state = ?StepState::Retrying, delay_ms = delay.as_millis() as u64, "Backing off");
        tokio::select! {
            () = self.ctx.cancel.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn event_context(&self, step: &Step) -> EventContext {
        EventContext::for_step(&self.suite.node_id, &step.name)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn base_result(
        &self,
        step: &Step,
        started: Instant,
        record: AttemptRecord,
        attempts: u32,
        status: StepStatus,
    ) -> StepResult {
        StepResult {
            step_name: step.name.clone(),
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            request_details: record.request_details,
            response_details: record.response.as_ref().map(HttpResponse::to_value),
            assertions_results: record.assertions,
            captured_variables: record.captured,
            scenarios_meta: record.scenarios,
            error: None,
            attempts,
            iterations: None,
            call_stack: record.call_stack,
        }
    }

    fn finalize_success(
        &self,
        step: &Step,
        started: Instant,
        record: AttemptRecord,
        attempts: u32,
    ) -> StepResult {
        debug!(step = %step.name, state = ?StepState::Done, attempts, "Step succeeded");
        self.ctx.bus.publish(
            LogLevel::Info,
            format!("Step '{}' succeeded", step.name),
            Some(&self.ctx.run_id),
            Some(self.event_context(step)),
        );
        self.base_result(step, started, record, attempts, StepStatus::Success)
    }

    fn finalize_failed(
        &self,
        step: &Step,
        started: Instant,
        record: AttemptRecord,
        attempts: u32,
    ) -> StepResult {
        let message = record
            .capture_error
            .clone()
            .or_else(|| {
                record
                    .assertions
                    .iter()
                    .find(|r| !r.passed)
                    .map(|r| r.message.clone())
            })
            .unwrap_or_else(|| "step failed".to_string());

        self.ctx.bus.publish(
            LogLevel::Error,
            message.clone(),
            Some(&self.ctx.run_id),
            Some(self.event_context(step)),
        );
        let mut result = self.base_result(step, started, record, attempts, StepStatus::Failure);
        result.error = Some(message);
        result
    }

    fn finalize_error(
        &self,
        step: &Step,
        started: Instant,
        record: AttemptRecord,
        attempts: u32,
        err: &Error,
    ) -> StepResult {
        self.ctx.bus.publish(
            LogLevel::Error,
            err.to_string(),
            Some(&self.ctx.run_id),
            Some(self.event_context(step).with_error(err)),
        );
        let status = if matches!(err, Error::Cancelled) {
            StepStatus::Cancelled
        } else {
            StepStatus::Failure
        };
        let mut result = self.base_result(step, started, record, attempts, status);
        result.error = Some(err.to_string());
        result
    }

    fn finalize_cancelled(
        &self,
        step: &Step,
        started: Instant,
        record: AttemptRecord,
        attempts: u32,
    ) -> StepResult {
        self.ctx.bus.publish(
            LogLevel::Warn,
            format!("Step '{}' cancelled", step.name),
            Some(&self.ctx.run_id),
            Some(self.event_context(step)),
        );
        let mut result = self.base_result(step, started, record, attempts, StepStatus::Cancelled);
        result.error = Some("cancelled".to_string());
        result
    }
}

fn render_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn request_to_value(request: &RequestSpec) -> Value {
    json!({
        "method": request.method,
        "url": request.url,
        "headers": request.headers,
        "query": request.query,
        "body": request.body,
        "timeout_ms": request.timeout_ms,
    })
}
