//! Cross-suite/step invocation.
//!
//! A `call` target resolves to a step in the caller's suite, a whole
//! suite by node id, or a step inside another suite via
//! `node_id.step_name`. The callee runs in a child scope seeded with the
//! caller's visible variables plus the call arguments; selected
//! variables propagate back. Depth is capped and cycles on the call
//! stack are rejected.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use crate::report::{StepResult, StepStatus};
use crate::scope::VariableScope;
use crate::suite::{CallSpec, Suite};
use crate::{Error, Result};

use super::step::StepRunner;
use super::RunContext;

/// Maximum call nesting.
pub const MAX_CALL_DEPTH: usize = 10;

/// Resolved call target.
pub enum CallTarget {
    /// One step of a suite.
    Step {
        /// Owning suite
        suite: Arc<Suite>,
        /// Step name within the suite
        step_name: String,
    },
    /// A whole suite.
    Suite(Arc<Suite>),
}

impl CallTarget {
    /// Canonical key used on the call stack for cycle detection.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Step { suite, step_name } => format!("{}.{step_name}", suite.node_id),
            Self::Suite(suite) => suite.node_id.clone(),
        }
    }
}

/// Outcome of a call, handed back to the caller.
pub struct CallOutcome {
    /// Summary value bound to `call_result`
    pub result: Value,
    /// Variables propagated into the caller's scope
    pub propagated: BTreeMap<String, Value>,
    /// The call chain, outermost first
    pub call_stack: Vec<String>,
    /// Step records produced by the callee
    pub step_results: Vec<StepResult>,
}

/// Resolve a target string against the caller's suite and the registry.
///
/// # Errors
///
/// `TargetNotFound` when nothing matches.
pub fn resolve_target(
    ctx: &RunContext,
    caller: &Suite,
    target: &str,
) -> Result<CallTarget> {
    if caller.step(target).is_some() {
        return Ok(CallTarget::Step {
            suite: ctx
                .suite(&caller.node_id)
                .unwrap_or_else(|| Arc::new(caller.clone())),
            step_name: target.to_string(),
        });
    }

    if let Some(suite) = ctx.suite(target) {
        return Ok(CallTarget::Suite(suite));
    }

    if let Some((node_id, step_name)) = target.rsplit_once('.') {
        if let Some(suite) = ctx.suite(node_id) {
            if suite.step(step_name).is_some() {
                return Ok(CallTarget::Step {
                    suite,
                    step_name: step_name.to_string(),
                });
            }
        }
    }

    Err(Error::TargetNotFound(target.to_string()))
}

/// Execute a call at the given nesting depth.
///
/// `depth` is the callee's nesting level: a top-level step calls at
/// depth 1. Boxed so steps and calls can recurse through each other.
pub fn execute_call<'a>(
    ctx: &'a RunContext,
    caller: &'a Suite,
    caller_scope: &'a VariableScope,
    spec: &'a CallSpec,
    depth: usize,
    call_stack: &'a [String],
) -> BoxFuture<'a, Result<CallOutcome>> {
    Box::pin(async move {
        if depth > MAX_CALL_DEPTH {
            let mut chain: Vec<String> = call_stack.to_vec();
            chain.push(spec.target.clone());
            return Err(Error::MaxCallDepthExceeded {
                depth,
                chain: chain.join(" -> "),
            });
        }
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let target = resolve_target(ctx, caller, &spec.target)?;
        let key = target.key();
        if call_stack.contains(&key) {
            return Err(Error::CircularCall(format!(
                "{} -> {key}",
                call_stack.join(" -> ")
            )));
        }

        let mut chain: Vec<String> = call_stack.to_vec();
        chain.push(key.clone());
        debug!(target = %key, depth, "Executing call");

        // Child scope: caller's visible variables plus arguments.
        let mut child_scope =
            VariableScope::new(Arc::clone(&ctx.env), Arc::clone(&ctx.globals));
        for (name, value) in caller_scope.visible_variables() {
            child_scope.set_suite_var(name, value);
        }
        for (name, raw) in &spec.with {
            let value = ctx
                .interpolator
                .interpolate_value(raw, caller_scope, &ctx.options)
                .await?;
            child_scope.set_suite_var(name.clone(), value);
        }

        let (callee_suite, step_results) = match &target {
            CallTarget::Step { suite, step_name } => {
                let step = suite
                    .step(step_name)
                    .ok_or_else(|| Error::TargetNotFound(key.clone()))?;
                let runner = StepRunner::new(ctx, suite);
                let result = runner.run(step, &mut child_scope, depth, &chain).await;
                (Arc::clone(suite), vec![result])
            }
            CallTarget::Suite(suite) => {
                let runner = StepRunner::new(ctx, suite);
                let mut results = Vec::new();
                let mut failed = false;
                for step in &suite.steps {
                    if failed {
                        results.push(StepResult::skipped(&step.name, "earlier step failed"));
                        continue;
                    }
                    let result = runner.run(step, &mut child_scope, depth, &chain).await;
                    let step_failed =
                        matches!(result.status, StepStatus::Failure | StepStatus::Cancelled);
                    let continues = step
                        .continue_on_failure
                        .or(suite.continue_on_failure)
                        .unwrap_or(ctx.default_continue_on_failure);
                    results.push(result);
                    if step_failed && !continues {
                        failed = true;
                    }
                }
                (Arc::clone(suite), results)
            }
        };

        let succeeded = step_results
            .iter()
            .all(|r| matches!(r.status, StepStatus::Success | StepStatus::Skipped));
        if !succeeded {
            let detail = step_results
                .iter()
                .find_map(|r| r.error.clone())
                .unwrap_or_else(|| "callee step failed".to_string());
            return Err(Error::Internal(format!("call '{key}' failed: {detail}")));
        }

        let propagated = propagated_variables(spec, &callee_suite, &child_scope);
        let result = json!({
            "target": key,
            "status": "success",
            "propagated": &propagated,
        });

        Ok(CallOutcome {
            result,
            propagated,
            call_stack: chain,
            step_results,
        })
    })
}

/// Names propagated back: the explicit `propagate` list, else the
/// callee's exports, else every capture the callee stored.
fn propagated_variables(
    spec: &CallSpec,
    callee: &Suite,
    child_scope: &VariableScope,
) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    if let Some(ref names) = spec.propagate {
        for name in names {
            if let Some(value) = child_scope.get(name) {
                out.insert(name.clone(), value);
            }
        }
        return out;
    }

    if !callee.exports.is_empty() {
        for name in &callee.exports {
            if let Some(value) = child_scope.get(name) {
                out.insert(name.clone(), value);
            }
        }
        return out;
    }

    for (name, value) in child_scope.captures() {
        out.insert(name.clone(), value.clone());
    }
    out
}
