//! Lifecycle hooks.
//!
//! Ten named points fire around a step's lifecycle; each holds an
//! ordered list of actions. A failing `validate` with severity `error`
//! short-circuits the remaining actions of that point.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::bus::{EventContext, LogBus, LogLevel};
use crate::capture::{CaptureContext, CaptureEngine};
use crate::http::HttpResponse;
use crate::interpolation::{js_inputs_from_scope, InterpolationOptions, Interpolator};
use crate::sandbox::JsSandbox;
use crate::scope::VariableScope;
use crate::suite::CallSpec;
use crate::{Error, Result};

/// Upper bound for `wait` actions.
pub const MAX_WAIT_MS: u64 = 60_000;

/// The hook points, in firing order within a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    /// Before input collection
    PreInput,
    /// After input collection
    PostInput,
    /// Before each iteration
    PreIteration,
    /// Before the request executes
    PreRequest,
    /// After the response arrives
    PostRequest,
    /// Before assertions run
    PreAssertion,
    /// After assertions run
    PostAssertion,
    /// Before captures run
    PreCapture,
    /// After captures run
    PostCapture,
    /// After each iteration
    PostIteration,
}

impl HookPoint {
    /// Name as it appears in suite files.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreInput => "pre_input",
            Self::PostInput => "post_input",
            Self::PreIteration => "pre_iteration",
            Self::PreRequest => "pre_request",
            Self::PostRequest => "post_request",
            Self::PreAssertion => "pre_assertion",
            Self::PostAssertion => "post_assertion",
            Self::PreCapture => "pre_capture",
            Self::PostCapture => "post_capture",
            Self::PostIteration => "post_iteration",
        }
    }
}

/// Hook actions registered per point.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HookSet {
    /// Actions before input collection
    #[serde(default)]
    pub pre_input: Vec<HookAction>,
    /// Actions after input collection
    #[serde(default)]
    pub post_input: Vec<HookAction>,
    /// Actions before each iteration
    #[serde(default)]
    pub pre_iteration: Vec<HookAction>,
    /// Actions before the request
    #[serde(default)]
    pub pre_request: Vec<HookAction>,
    /// Actions after the response
    #[serde(default)]
    pub post_request: Vec<HookAction>,
    /// Actions before assertions
    #[serde(default)]
    pub pre_assertion: Vec<HookAction>,
    /// Actions after assertions
    #[serde(default)]
    pub post_assertion: Vec<HookAction>,
    /// Actions before captures
    #[serde(default)]
    pub pre_capture: Vec<HookAction>,
    /// Actions after captures
    #[serde(default)]
    pub post_capture: Vec<HookAction>,
    /// Actions after each iteration
    #[serde(default)]
    pub post_iteration: Vec<HookAction>,
}

impl HookSet {
    /// The actions registered at a point.
    #[must_use]
    pub fn at(&self, point: HookPoint) -> &[HookAction] {
        match point {
            HookPoint::PreInput => &self.pre_input,
            HookPoint::PostInput => &self.post_input,
            HookPoint::PreIteration => &self.pre_iteration,
            HookPoint::PreRequest => &self.pre_request,
            HookPoint::PostRequest => &self.post_request,
            HookPoint::PreAssertion => &self.pre_assertion,
            HookPoint::PostAssertion => &self.post_assertion,
            HookPoint::PreCapture => &self.pre_capture,
            HookPoint::PostCapture => &self.post_capture,
            HookPoint::PostIteration => &self.post_iteration,
        }
    }
}

/// One hook action. Externally tagged: `- compute: {...}`, `- wait: 100`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookAction {
    /// Set runtime variables from resolved expressions.
    Compute(BTreeMap<String, Value>),
    /// Capture values from the execution context.
    Capture(BTreeMap<String, String>),
    /// Promote already-known runtime variables to the global table.
    Exports(Vec<String>),
    /// Boolean validations; severity `error` short-circuits the point.
    Validate(Vec<ValidateSpec>),
    /// Emit an event through the bus.
    Log(LogSpec),
    /// Emit a metric event.
    Metric(MetricSpec),
    /// Run a JavaScript block.
    Script(String),
    /// Delegate to the call service.
    Call(CallSpec),
    /// Sleep for the resolved number of milliseconds (capped).
    Wait(Value),
}

/// One validation inside a `validate` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateSpec {
    /// JavaScript boolean expression.
    pub expression: String,
    /// Message reported on failure.
    #[serde(default)]
    pub message: Option<String>,
    /// Failure severity.
    #[serde(default)]
    pub severity: Severity,
}

/// Validation severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Emit a warning event and continue.
    Warning,
    /// Raise `HookValidationFailed` and stop the point.
    #[default]
    Error,
}

/// `log` action payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSpec {
    /// Event level (default info).
    #[serde(default)]
    pub level: Option<String>,
    /// Message template.
    pub message: String,
    /// Extra metadata.
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// `metric` action payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Metric name.
    pub name: String,
    /// Metric value expression.
    #[serde(default)]
    pub value: Option<Value>,
    /// Dimension tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Executes `call` actions on behalf of the hook runner; implemented by
/// the step executor so hooks can reach the call service.
#[async_trait]
pub trait CallDelegate: Send + Sync {
    /// Run a cross-suite/step call, returning the propagated result.
    async fn call(&self, spec: &CallSpec, scope: &mut VariableScope) -> Result<Value>;
}

/// A delegate that rejects `call` actions; used where nesting is not
/// available (best-effort cancellation hooks).
pub struct NoCalls;

#[async_trait]
impl CallDelegate for NoCalls {
    async fn call(&self, _spec: &CallSpec, _scope: &mut VariableScope) -> Result<Value> {
        Err(Error::Internal(
            "call actions are not available in this hook context".to_string(),
        ))
    }
}

/// Everything a hook action may touch, borrowed from the step executor.
pub struct HookEnv<'a> {
    /// Interpolation service
    pub interpolator: &'a Interpolator,
    /// JS sandbox
    pub sandbox: &'a JsSandbox,
    /// Capture engine
    pub captures: &'a CaptureEngine,
    /// Event bus
    pub bus: &'a LogBus,
    /// Current run id
    pub run_id: &'a str,
    /// Current suite
    pub node_id: &'a str,
    /// Current step
    pub step_name: &'a str,
    /// Response, at post-request points onward
    pub response: Option<&'a HttpResponse>,
    /// Cancellation token, checked before each action
    pub cancel: &'a CancellationToken,
    /// Interpolation switches
    pub options: &'a InterpolationOptions,
}

impl HookEnv<'_> {
    fn event_context(&self) -> EventContext {
        EventContext::for_step(self.node_id, self.step_name)
    }
}

/// Drives the actions of one hook point in declaration order.
#[derive(Default)]
pub struct HookRunner;

impl HookRunner {
    /// Create a runner.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Execute every action registered at a point.
    ///
    /// # Errors
    ///
    /// `HookValidationFailed` stops the point; `Cancelled` when the token
    /// fires; action errors propagate.
    pub async fn run_point(
        &self,
        point: HookPoint,
        actions: &[HookAction],
        scope: &mut VariableScope,
        env: &HookEnv<'_>,
        delegate: &dyn CallDelegate,
    ) -> Result<()> {
        for action in actions {
            if env.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.run_action(point, action, scope, env, delegate).await?;
        }
        Ok(())
    }

    async fn run_action(
        &self,
        point: HookPoint,
        action: &HookAction,
        scope: &mut VariableScope,
        env: &HookEnv<'_>,
        delegate: &dyn CallDelegate,
    ) -> Result<()> {
        match action {
            HookAction::Compute(assignments) => {
                for (name, raw) in assignments {
                    let value = env
                        .interpolator
                        .interpolate_value(raw, scope, env.options)
                        .await?;
                    scope.set_local(name.clone(), value);
                }
            }

            HookAction::Capture(captures) => {
                let ctx = CaptureContext {
                    response: env.response,
                    ..CaptureContext::default()
                };
                for (name, expr) in captures {
                    let value = env
                        .captures
                        .capture(name, expr, &ctx, scope, env.interpolator, env.sandbox, env.options)
                        .await?;
                    scope.set_capture(name.clone(), value);
                }
            }

            HookAction::Exports(names) => {
                for name in names {
                    let Some(value) = scope.get(name) else {
                        warn!(variable = %name, "Export of unknown variable skipped");
                        continue;
                    };
                    if scope.export_global(env.node_id, name, value) {
                        env.bus.publish(
                            LogLevel::Warn,
                            format!("Global export '{}.{name}' overwritten", env.node_id),
                            Some(env.run_id),
                            Some(env.event_context()),
                        );
                    }
                }
            }

            HookAction::Validate(validations) => {
                for validation in validations {
                    self.run_validation(point, validation, scope, env).await?;
                }
            }

            HookAction::Log(spec) => {
                let message = match env
                    .interpolator
                    .interpolate_str(&spec.message, scope, env.options)
                    .await?
                {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let level = spec
                    .level
                    .as_deref()
                    .and_then(|l| l.parse().ok())
                    .unwrap_or(LogLevel::Info);
                let mut context = env.event_context();
                if let Some(ref metadata) = spec.metadata {
                    context.metadata = Some(
                        env.interpolator
                            .interpolate_value(metadata, scope, env.options)
                            .await?,
                    );
                }
                env.bus.publish(level, message, Some(env.run_id), Some(context));
            }

            HookAction::Metric(spec) => {
                let value = match spec.value {
                    Some(ref raw) => {
                        env.interpolator
                            .interpolate_value(raw, scope, env.options)
                            .await?
                    }
                    None => json!(1),
                };
                let context = env.event_context().with_metadata(json!({
                    "metric": spec.name,
                    "value": value,
                    "tags": spec.tags,
                }));
                env.bus.publish(
                    LogLevel::Info,
                    format!("metric {}", spec.name),
                    Some(env.run_id),
                    Some(context),
                );
            }

            HookAction::Script(source) => {
                let mut inputs = js_inputs_from_scope(scope);
                inputs.response = env.response.map(HttpResponse::to_value);
                env.sandbox.eval(source, true, &inputs).await?;
            }

            HookAction::Call(spec) => {
                let result = delegate.call(spec, scope).await?;
                scope.set_local("call_result", result);
            }

            HookAction::Wait(raw) => {
                let resolved = env
                    .interpolator
                    .interpolate_value(raw, scope, env.options)
                    .await?;
                let millis = wait_millis(&resolved)?;
                tokio::select! {
                    () = env.cancel.cancelled() => return Err(Error::Cancelled),
                    () = tokio::time::sleep(Duration::from_millis(millis)) => {}
                }
            }
        }
        Ok(())
    }

    async fn run_validation(
        &self,
        point: HookPoint,
        validation: &ValidateSpec,
        scope: &mut VariableScope,
        env: &HookEnv<'_>,
    ) -> Result<()> {
        let mut inputs = js_inputs_from_scope(scope);
        inputs.response = env.response.map(HttpResponse::to_value);
        let source = validation.expression.trim();
        let source = source
            .strip_prefix("$js:")
            .unwrap_or_else(|| source.trim_start_matches('$'))
            .trim();
        let code_block = source.starts_with("return") || source.contains(';');
        let holds = env.sandbox.eval_bool(source, code_block, &inputs).await?;
        if holds {
            return Ok(());
        }

        let message = validation
            .message
            .clone()
            .unwrap_or_else(|| format!("validation failed: {}", validation.expression));
        match validation.severity {
            Severity::Warning => {
                env.bus.publish(
                    LogLevel::Warn,
                    format!("{} [{}]", message, point.as_str()),
                    Some(env.run_id),
                    Some(env.event_context()),
                );
                Ok(())
            }
            Severity::Error => {
                env.bus.publish(
                    LogLevel::Error,
                    message.clone(),
                    Some(env.run_id),
                    Some(env.event_context()),
                );
                Err(Error::HookValidationFailed(message))
            }
        }
    }
}

/// Resolve a `wait` payload to milliseconds, clamped to [`MAX_WAIT_MS`].
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn wait_millis(value: &Value) -> Result<u64> {
    let millis = match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    millis
        .map(|m| m.min(MAX_WAIT_MS))
        .ok_or_else(|| Error::Config(format!("Invalid wait duration: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::GlobalExports;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn parts() -> (
        Arc<LogBus>,
        Interpolator,
        JsSandbox,
        CaptureEngine,
        CancellationToken,
    ) {
        let sandbox = Arc::new(JsSandbox::default());
        (
            Arc::new(LogBus::new()),
            Interpolator::new(Arc::clone(&sandbox)),
            JsSandbox::default(),
            CaptureEngine::new(),
            CancellationToken::new(),
        )
    }

    fn scope() -> VariableScope {
        let mut scope =
            VariableScope::new(Arc::new(HashMap::new()), Arc::new(GlobalExports::new()));
        scope.set_suite_var("count", json!(2));
        scope
    }

    fn hookset(yaml: &str) -> HookSet {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn hook_actions_deserialize_from_yaml() {
        let hooks = hookset(
            r"
pre_request:
  - compute: { trace: 'abc' }
  - log: { level: info, message: starting }
  - wait: 5
post_request:
  - validate:
      - { expression: 'response.status == 200', severity: warning }
",
        );
        assert_eq!(hooks.pre_request.len(), 3);
        assert_eq!(hooks.post_request.len(), 1);
        assert!(matches!(hooks.pre_request[0], HookAction::Compute(_)));
        assert!(matches!(hooks.pre_request[2], HookAction::Wait(_)));
    }

    #[tokio::test]
    async fn compute_sets_runtime_variables() {
        let (bus, interpolator, sandbox, captures, cancel) = parts();
        let mut scope = scope();
        let env = HookEnv {
            interpolator: &interpolator,
            sandbox: &sandbox,
            captures: &captures,
            bus: &bus,
            run_id: "run-1",
            node_id: "suite-a",
            step_name: "step-1",
            response: None,
            cancel: &cancel,
            options: &InterpolationOptions::default(),
        };
        let actions = vec![HookAction::Compute(BTreeMap::from([(
            "doubled".to_string(),
            json!("{{$js: count * 2}}"),
        )]))];

        HookRunner::new()
            .run_point(HookPoint::PreRequest, &actions, &mut scope, &env, &NoCalls)
            .await
            .unwrap();
        assert_eq!(scope.get("doubled"), Some(json!(4)));
    }

    #[tokio::test]
    async fn failing_error_validation_short_circuits() {
        let (bus, interpolator, sandbox, captures, cancel) = parts();
        let mut scope = scope();
        let env = HookEnv {
            interpolator: &interpolator,
            sandbox: &sandbox,
            captures: &captures,
            bus: &bus,
            run_id: "run-1",
            node_id: "suite-a",
            step_name: "step-1",
            response: None,
            cancel: &cancel,
            options: &InterpolationOptions::default(),
        };
        let actions = vec![
            HookAction::Validate(vec![ValidateSpec {
                expression: "count > 100".to_string(),
                message: Some("count too small".to_string()),
                severity: Severity::Error,
            }]),
            HookAction::Compute(BTreeMap::from([("after".to_string(), json!(true))])),
        ];

        let err = HookRunner::new()
            .run_point(HookPoint::PreAssertion, &actions, &mut scope, &env, &NoCalls)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HookValidationFailed(_)));
        assert_eq!(scope.get("after"), None);
    }

    #[tokio::test]
    async fn warning_validation_continues() {
        let (bus, interpolator, sandbox, captures, cancel) = parts();
        let mut scope = scope();
        let env = HookEnv {
            interpolator: &interpolator,
            sandbox: &sandbox,
            captures: &captures,
            bus: &bus,
            run_id: "run-1",
            node_id: "suite-a",
            step_name: "step-1",
            response: None,
            cancel: &cancel,
            options: &InterpolationOptions::default(),
        };
        let actions = vec![
            HookAction::Validate(vec![ValidateSpec {
                expression: "false".to_string(),
                message: None,
                severity: Severity::Warning,
            }]),
            HookAction::Compute(BTreeMap::from([("after".to_string(), json!(true))])),
        ];

        HookRunner::new()
            .run_point(HookPoint::PreAssertion, &actions, &mut scope, &env, &NoCalls)
            .await
            .unwrap();
        assert_eq!(scope.get("after"), Some(json!(true)));
    }

    #[tokio::test]
    async fn exports_promote_to_the_global_table() {
        let (bus, interpolator, sandbox, captures, cancel) = parts();
        let mut scope = scope();
        scope.set_local("token", json!("t-123"));
        let env = HookEnv {
            interpolator: &interpolator,
            sandbox: &sandbox,
            captures: &captures,
            bus: &bus,
            run_id: "run-1",
            node_id: "suite-a",
            step_name: "step-1",
            response: None,
            cancel: &cancel,
            options: &InterpolationOptions::default(),
        };
        let actions = vec![HookAction::Exports(vec!["token".to_string()])];

        HookRunner::new()
            .run_point(HookPoint::PostCapture, &actions, &mut scope, &env, &NoCalls)
            .await
            .unwrap();
        assert_eq!(scope.globals().get("suite-a", "token"), Some(json!("t-123")));
    }

    #[test]
    fn wait_values_clamp_to_the_cap() {
        assert_eq!(wait_millis(&json!(100)).unwrap(), 100);
        assert_eq!(wait_millis(&json!(99_999_999)).unwrap(), MAX_WAIT_MS);
        assert_eq!(wait_millis(&json!("250")).unwrap(), 250);
        assert!(wait_millis(&json!(null)).is_err());
    }
}
