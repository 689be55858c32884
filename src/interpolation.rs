//! `{{...}}` interpolation.
//!
//! A strategy chain resolves each placeholder; strategies are consulted
//! in priority order (env=10, faker=20, javascript=30, variable=100) and
//! the first whose `can_handle` matches wins. Strings are re-scanned
//! until no placeholder remains or a fixed point is reached, bounded by
//! [`MAX_PASSES`]. Structured values descend recursively with a depth
//! guard.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use crate::bus::{EventContext, LogBus, LogLevel};
use crate::faker;
use crate::sandbox::{JsInputs, JsSandbox};
use crate::scope::VariableScope;
use crate::{Error, Result};

/// Maximum string re-scan passes before `InterpolationLoop` is raised.
pub const MAX_PASSES: usize = 8;
/// Structural descent guard for pathological nesting.
const MAX_VALUE_DEPTH: usize = 64;

/// Per-call interpolation switches.
#[derive(Debug, Clone, Default)]
pub struct InterpolationOptions {
    /// Don't emit warnings for unresolved variables.
    pub suppress_warnings: bool,
    /// Treat unresolved variables as errors instead of leaving the
    /// placeholder intact.
    pub strict_vars: bool,
}

/// One resolution strategy in the chain.
#[async_trait]
pub trait ResolutionStrategy: Send + Sync {
    /// Strategy name, used in diagnostics.
    fn name(&self) -> &'static str;

    /// Chain position; lower priorities are consulted first.
    fn priority(&self) -> u32;

    /// Whether this strategy claims the expression.
    fn can_handle(&self, expr: &str) -> bool;

    /// Resolve the expression. `Ok(None)` leaves the placeholder intact.
    async fn resolve(
        &self,
        expr: &str,
        scope: &VariableScope,
        sandbox: &JsSandbox,
        options: &InterpolationOptions,
    ) -> Result<Option<Value>>;
}

/// `$env.NAME` -> env snapshot; a miss resolves to `null`, never a failure.
struct EnvStrategy;

#[async_trait]
impl ResolutionStrategy for EnvStrategy {
    fn name(&self) -> &'static str {
        "env"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn can_handle(&self, expr: &str) -> bool {
        expr.trim().starts_with("$env.")
    }

    async fn resolve(
        &self,
        expr: &str,
        scope: &VariableScope,
        _sandbox: &JsSandbox,
        _options: &InterpolationOptions,
    ) -> Result<Option<Value>> {
        let name = expr.trim().trim_start_matches("$env.");
        Ok(Some(
            scope
                .env()
                .get(name)
                .map_or(Value::Null, |v| Value::String(v.clone())),
        ))
    }
}

/// `#faker.category.method(args?)` generation.
struct FakerStrategy;

#[async_trait]
impl ResolutionStrategy for FakerStrategy {
    fn name(&self) -> &'static str {
        "faker"
    }

    fn priority(&self) -> u32 {
        20
    }

    fn can_handle(&self, expr: &str) -> bool {
        let trimmed = expr.trim();
        trimmed.starts_with("#faker.") || trimmed.starts_with("faker.")
    }

    async fn resolve(
        &self,
        expr: &str,
        _scope: &VariableScope,
        _sandbox: &JsSandbox,
        _options: &InterpolationOptions,
    ) -> Result<Option<Value>> {
        let payload = expr
            .trim()
            .trim_start_matches("#faker.")
            .trim_start_matches("faker.");
        faker::generate(payload).map(Some)
    }
}

/// `$expr` / `$js: expr` evaluation through the sandbox.
///
/// Placeholders nested inside the script body are pre-resolved with env
/// and variables only; re-entering faker or javascript from inside a
/// script is forbidden, so such placeholders stay intact.
struct JavascriptStrategy;

impl JavascriptStrategy {
    fn preprocess(source: &str, scope: &VariableScope) -> String {
        let mut result = String::new();
        let mut rest = source;
        while let Some(found) = find_placeholder(rest) {
            result.push_str(&rest[..found.start]);
            let inner = found.inner.trim();
            let replacement = if let Some(name) = inner.strip_prefix("$env.") {
                Some(scope.env().get(name).cloned().unwrap_or_default())
            } else if inner.starts_with('$') || inner.starts_with("#faker.") {
                warn!(expr = %inner, "Nested faker/javascript inside a script is forbidden; leaving placeholder");
                None
            } else {
                scope.resolve_path(inner).ok().map(|v| render_inline(&v))
            };
            match replacement {
                Some(text) => result.push_str(&text),
                None => result.push_str(&rest[found.start..found.end]),
            }
            rest = &rest[found.end..];
        }
        result.push_str(rest);
        result
    }
}

#[async_trait]
impl ResolutionStrategy for JavascriptStrategy {
    fn name(&self) -> &'static str {
        "javascript"
    }

    fn priority(&self) -> u32 {
        30
    }

    fn can_handle(&self, expr: &str) -> bool {
        expr.trim().starts_with('$')
    }

    async fn resolve(
        &self,
        expr: &str,
        scope: &VariableScope,
        sandbox: &JsSandbox,
        _options: &InterpolationOptions,
    ) -> Result<Option<Value>> {
        let trimmed = expr.trim();
        let source = trimmed
            .strip_prefix("$js:")
            .unwrap_or_else(|| trimmed.trim_start_matches('$'))
            .trim();
        let source = Self::preprocess(source, scope);
        let code_block = source.starts_with("return") || source.contains(';');
        let inputs = js_inputs_from_scope(scope);
        sandbox.eval(&source, code_block, &inputs).await.map(Some)
    }
}

/// Fallback: resolve through the variable scope. May return `None`
/// (placeholder stays, a warning is emitted unless suppressed).
struct VariableStrategy;

#[async_trait]
impl ResolutionStrategy for VariableStrategy {
    fn name(&self) -> &'static str {
        "variable"
    }

    fn priority(&self) -> u32 {
        100
    }

    fn can_handle(&self, _expr: &str) -> bool {
        true
    }

    async fn resolve(
        &self,
        expr: &str,
        scope: &VariableScope,
        _sandbox: &JsSandbox,
        options: &InterpolationOptions,
    ) -> Result<Option<Value>> {
        match scope.resolve_path(expr.trim()) {
            Ok(value) => Ok(Some(value)),
            Err(Error::NotFound(name)) => {
                if options.strict_vars {
                    Err(Error::UnresolvedVariable(name))
                } else {
                    Ok(None)
                }
            }
            Err(err) => {
                if options.strict_vars {
                    Err(err)
                } else {
                    Ok(None)
                }
            }
        }
    }
}

/// Build sandbox inputs from everything visible in a scope.
pub fn js_inputs_from_scope(scope: &VariableScope) -> JsInputs {
    JsInputs {
        variables: scope.visible_variables(),
        captured: scope
            .captures()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<BTreeMap<_, _>>(),
        response: scope.get("response"),
        request: scope.get("request"),
        env: scope
            .env()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

/// The interpolation service. One instance is shared across a run.
pub struct Interpolator {
    strategies: Vec<Arc<dyn ResolutionStrategy>>,
    sandbox: Arc<JsSandbox>,
    bus: Option<Arc<LogBus>>,
}

impl Interpolator {
    /// Create a service with the default strategy chain.
    #[must_use]
    pub fn new(sandbox: Arc<JsSandbox>) -> Self {
        let mut strategies: Vec<Arc<dyn ResolutionStrategy>> = vec![
            Arc::new(EnvStrategy),
            Arc::new(FakerStrategy),
            Arc::new(JavascriptStrategy),
            Arc::new(VariableStrategy),
        ];
        strategies.sort_by_key(|s| s.priority());
        Self {
            strategies,
            sandbox,
            bus: None,
        }
    }

    /// Attach the bus used for unresolved-variable warning events.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<LogBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Interpolate a string. A string that is exactly one placeholder
    /// preserves the resolved value's type; embedded placeholders render
    /// as text.
    ///
    /// # Errors
    ///
    /// `InterpolationLoop` when the pass budget is exhausted without
    /// reaching a fixed point; strategy errors propagate.
    pub async fn interpolate_str(
        &self,
        input: &str,
        scope: &VariableScope,
        options: &InterpolationOptions,
    ) -> Result<Value> {
        let mut current = input.to_string();
        let mut passes = 0usize;

        loop {
            if find_placeholder(&current).is_none() {
                return Ok(Value::String(current));
            }
            if passes >= MAX_PASSES {
                return Err(Error::InterpolationLoop(input.to_string()));
            }
            passes += 1;

            // Sole-placeholder strings keep the resolved type.
            let sole_expr = find_placeholder(&current).and_then(|found| {
                (current.trim() == &current[found.start..found.end])
                    .then(|| found.inner.trim().to_string())
            });
            if let Some(expr) = sole_expr {
                match self.resolve_expr(&expr, scope, options).await? {
                    Some(Value::String(text)) => {
                        current = text;
                        continue;
                    }
                    Some(value) => return Ok(value),
                    None => {
                        self.warn_unresolved(&expr, options);
                        return Ok(Value::String(current));
                    }
                }
            }

            let (next, resolved_any) = self.replace_pass(&current, scope, options).await?;
            if !resolved_any {
                return Ok(Value::String(next));
            }
            current = next;
        }
    }

    /// Interpolate a structured value, descending into arrays and maps.
    pub fn interpolate_value<'a>(
        &'a self,
        value: &'a Value,
        scope: &'a VariableScope,
        options: &'a InterpolationOptions,
    ) -> BoxFuture<'a, Result<Value>> {
        self.interpolate_value_at(value, scope, options, 0)
    }

    fn interpolate_value_at<'a>(
        &'a self,
        value: &'a Value,
        scope: &'a VariableScope,
        options: &'a InterpolationOptions,
        depth: usize,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            if depth >= MAX_VALUE_DEPTH {
                return Err(Error::Internal(
                    "interpolation descent exceeded the depth guard".to_string(),
                ));
            }
            match value {
                Value::String(text) => self.interpolate_str(text, scope, options).await,
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(
                            self.interpolate_value_at(item, scope, options, depth + 1)
                                .await?,
                        );
                    }
                    Ok(Value::Array(out))
                }
                Value::Object(map) => {
                    let mut out = serde_json::Map::with_capacity(map.len());
                    for (key, item) in map {
                        out.insert(
                            key.clone(),
                            self.interpolate_value_at(item, scope, options, depth + 1)
                                .await?,
                        );
                    }
                    Ok(Value::Object(out))
                }
                other => Ok(other.clone()),
            }
        })
    }

    /// One left-to-right replacement pass over embedded placeholders.
    async fn replace_pass(
        &self,
        input: &str,
        scope: &VariableScope,
        options: &InterpolationOptions,
    ) -> Result<(String, bool)> {
        let mut result = String::new();
        let mut rest = input;
        let mut resolved_any = false;

        while let Some(found) = find_placeholder(rest) {
            result.push_str(&rest[..found.start]);
            match self.resolve_expr(found.inner.trim(), scope, options).await? {
                Some(value) => {
                    result.push_str(&render_inline(&value));
                    resolved_any = true;
                }
                None => {
                    self.warn_unresolved(found.inner.trim(), options);
                    result.push_str(&rest[found.start..found.end]);
                }
            }
            rest = &rest[found.end..];
        }
        result.push_str(rest);
        Ok((result, resolved_any))
    }

    /// Run the strategy chain for one placeholder expression.
    async fn resolve_expr(
        &self,
        expr: &str,
        scope: &VariableScope,
        options: &InterpolationOptions,
    ) -> Result<Option<Value>> {
        for strategy in &self.strategies {
            if strategy.can_handle(expr) {
                return strategy
                    .resolve(expr, scope, &self.sandbox, options)
                    .await;
            }
        }
        Ok(None)
    }

    fn warn_unresolved(&self, expr: &str, options: &InterpolationOptions) {
        if options.suppress_warnings {
            return;
        }
        let message = format!("Unresolved variable in template: {expr}");
        if let Some(ref bus) = self.bus {
            bus.publish(LogLevel::Warn, &message, None, Some(EventContext::default()));
        }
        warn!("{message}");
    }
}

/// A located `{{ ... }}` occurrence.
struct Placeholder<'a> {
    start: usize,
    end: usize,
    inner: &'a str,
}

/// Find the first placeholder, tolerating single braces inside the
/// expression body (object literals in scripts).
fn find_placeholder(s: &str) -> Option<Placeholder<'_>> {
    let start = s.find("{{")?;
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut i = start + 2;
    while i < bytes.len() {
        match bytes[i] {
            b'{' => depth += 1,
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                } else if bytes.get(i + 1) == Some(&b'}') {
                    return Some(Placeholder {
                        start,
                        end: i + 2,
                        inner: &s[start + 2..i],
                    });
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// String form used when a value is embedded inside surrounding text.
fn render_inline(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
