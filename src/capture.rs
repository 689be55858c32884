//! Capture engine: extract values from the execution context and store
//! them in the step-local scope.
//!
//! Source expressions are classified first (JMESPath by default, `$...`
//! for JavaScript, `#faker.` for generation, `{{...}}` for templates) and
//! routed to the matching subsystem. The JMESPath document exposes the
//! response (with `body`/`status`/`headers` mirrored at the root),
//! variables, collected input, call results, prior captures and
//! assertion results.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::assertion::AssertionResult;
use crate::expression::{self, ExpressionCategory};
use crate::http::HttpResponse;
use crate::interpolation::{js_inputs_from_scope, InterpolationOptions, Interpolator};
use crate::sandbox::JsSandbox;
use crate::scope::VariableScope;
use crate::{faker, Error, Result};

/// Run a JMESPath query over a JSON document.
///
/// # Errors
///
/// Returns a configuration error for unparseable expressions; query
/// misses resolve to `null`.
pub fn jmespath_search(expr: &str, doc: &Value) -> Result<Value> {
    let compiled = jmespath::compile(expr)
        .map_err(|e| Error::Config(format!("Invalid JMESPath expression '{expr}': {e}")))?;
    let data = jmespath::Variable::from_json(&doc.to_string())
        .map_err(|e| Error::Internal(format!("failed to build JMESPath document: {e}")))?;
    let result = compiled
        .search(data)
        .map_err(|e| Error::Internal(format!("JMESPath search failed: {e}")))?;
    Ok(variable_to_value(&result))
}

/// Convert a JMESPath variable back into a JSON value through its
/// public accessors.
#[allow(clippy::cast_possible_truncation)]
fn variable_to_value(var: &jmespath::Variable) -> Value {
    if var.is_null() {
        return Value::Null;
    }
    if let Some(b) = var.as_boolean() {
        return Value::Bool(b);
    }
    if let Some(n) = var.as_number() {
        // Integral results come back as whole-valued floats; restore the
        // integer representation so deep equality against parsed JSON holds.
        if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
            return Value::Number(serde_json::Number::from(n as i64));
        }
        return serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number);
    }
    if let Some(s) = var.as_string() {
        return Value::String(s.clone());
    }
    if let Some(items) = var.as_array() {
        return Value::Array(items.iter().map(|item| variable_to_value(item)).collect());
    }
    if let Some(map) = var.as_object() {
        return Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), variable_to_value(v)))
                .collect(),
        );
    }
    Value::Null
}

/// Everything a capture expression may draw from.
#[derive(Default)]
pub struct CaptureContext<'a> {
    /// Response of the current step, when a request ran.
    pub response: Option<&'a HttpResponse>,
    /// Collected input values.
    pub input: Option<&'a Value>,
    /// Result of a `call` action.
    pub call_result: Option<&'a Value>,
    /// Assertion results accumulated so far in this step.
    pub assertion_results: &'a [AssertionResult],
}

impl CaptureContext<'_> {
    /// Build the JMESPath document.
    #[must_use]
    pub fn document(&self, scope: &VariableScope) -> Value {
        let response = self.response.map(HttpResponse::to_value);
        let variables: BTreeMap<String, Value> = scope.visible_variables();
        json!({
            "response": response,
            "body": self.response.map(|r| r.body.clone()),
            "status": self.response.map(|r| r.status),
            "headers": self.response.map(|r| r.headers.clone()),
            "variables": variables,
            "input": self.input,
            "call_result": self.call_result,
            "captured_variables": scope.captures().clone(),
            "assertion_results": self.assertion_results,
        })
    }
}

/// The capture engine. Stateless; shared across a run.
#[derive(Default)]
pub struct CaptureEngine;

impl CaptureEngine {
    /// Create an engine.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Evaluate one `(name, source_expr)` capture pair.
    ///
    /// # Errors
    ///
    /// All failures are wrapped in `CaptureFailed` carrying the target
    /// variable name.
    pub async fn capture(
        &self,
        name: &str,
        source_expr: &str,
        ctx: &CaptureContext<'_>,
        scope: &VariableScope,
        interpolator: &Interpolator,
        sandbox: &JsSandbox,
        options: &InterpolationOptions,
    ) -> Result<Value> {
        self.capture_inner(source_expr, ctx, scope, interpolator, sandbox, options)
            .await
            .map_err(|source| Error::CaptureFailed {
                name: name.to_string(),
                source: Box::new(source),
            })
    }

    async fn capture_inner(
        &self,
        source_expr: &str,
        ctx: &CaptureContext<'_>,
        scope: &VariableScope,
        interpolator: &Interpolator,
        sandbox: &JsSandbox,
        options: &InterpolationOptions,
    ) -> Result<Value> {
        let parsed = expression::parse(source_expr)?;
        match parsed.category {
            ExpressionCategory::Jmespath => {
                // Interpolate first, then compile the query.
                let query = match interpolator
                    .interpolate_str(&parsed.payload, scope, options)
                    .await?
                {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                jmespath_search(&query, &ctx.document(scope))
            }
            ExpressionCategory::Javascript => {
                let mut inputs = js_inputs_from_scope(scope);
                inputs.response = ctx.response.map(HttpResponse::to_value);
                if let Some(input) = ctx.input {
                    inputs.variables.insert("input".to_string(), input.clone());
                }
                if let Some(call_result) = ctx.call_result {
                    inputs
                        .variables
                        .insert("call_result".to_string(), call_result.clone());
                }
                sandbox
                    .eval(&parsed.payload, parsed.code_block, &inputs)
                    .await
            }
            ExpressionCategory::Faker => faker::generate(&parsed.payload),
            ExpressionCategory::Template | ExpressionCategory::Literal => {
                interpolator
                    .interpolate_str(&parsed.payload, scope, options)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::GlobalExports;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn response() -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
            body: json!({"name": "Ada Lovelace", "roles": ["admin", "author"]}),
            raw_body: String::new(),
            response_time_ms: 20,
        }
    }

    fn scope() -> VariableScope {
        let mut scope =
            VariableScope::new(Arc::new(HashMap::new()), Arc::new(GlobalExports::new()));
        scope.set_suite_var("expected_role", json!("admin"));
        scope
    }

    fn engine_parts() -> (CaptureEngine, Interpolator, JsSandbox) {
        let sandbox = Arc::new(JsSandbox::default());
        (
            CaptureEngine::new(),
            Interpolator::new(Arc::clone(&sandbox)),
            JsSandbox::default(),
        )
    }

    #[test]
    fn jmespath_queries_resolve_against_documents() {
        let doc = json!({"body": {"items": [{"id": 7}]}});
        assert_eq!(jmespath_search("body.items[0].id", &doc).unwrap(), json!(7));
        assert_eq!(jmespath_search("body.missing", &doc).unwrap(), Value::Null);
    }

    #[test]
    fn invalid_jmespath_is_rejected() {
        assert!(jmespath_search("[invalid", &json!({})).is_err());
    }

    #[tokio::test]
    async fn body_paths_capture_from_responses() {
        let (engine, interpolator, sandbox) = engine_parts();
        let response = response();
        let ctx = CaptureContext {
            response: Some(&response),
            ..CaptureContext::default()
        };
        let value = engine
            .capture(
                "user_name",
                "@body.name",
                &ctx,
                &scope(),
                &interpolator,
                &sandbox,
                &InterpolationOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(value, json!("Ada Lovelace"));
    }

    #[tokio::test]
    async fn javascript_captures_see_the_response() {
        let (engine, interpolator, sandbox) = engine_parts();
        let response = response();
        let ctx = CaptureContext {
            response: Some(&response),
            ..CaptureContext::default()
        };
        let value = engine
            .capture(
                "role_count",
                "$response.body.roles.length",
                &ctx,
                &scope(),
                &interpolator,
                &sandbox,
                &InterpolationOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(value, json!(2));
    }

    #[tokio::test]
    async fn forbidden_javascript_fails_as_capture_failed() {
        let (engine, interpolator, sandbox) = engine_parts();
        let ctx = CaptureContext::default();
        let err = engine
            .capture(
                "token",
                "$require('fs')",
                &ctx,
                &scope(),
                &interpolator,
                &sandbox,
                &InterpolationOptions::default(),
            )
            .await
            .unwrap_err();
        match err {
            Error::CaptureFailed { name, source } => {
                assert_eq!(name, "token");
                assert!(matches!(*source, Error::JsValidation(_)));
            }
            other => panic!("expected CaptureFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn faker_captures_generate_values() {
        let (engine, interpolator, sandbox) = engine_parts();
        let ctx = CaptureContext::default();
        let value = engine
            .capture(
                "email",
                "#faker.internet.email",
                &ctx,
                &scope(),
                &interpolator,
                &sandbox,
                &InterpolationOptions::default(),
            )
            .await
            .unwrap();
        assert!(value.as_str().unwrap().contains('@'));
    }

    #[tokio::test]
    async fn templates_capture_through_interpolation() {
        let (engine, interpolator, sandbox) = engine_parts();
        let ctx = CaptureContext::default();
        let value = engine
            .capture(
                "role",
                "{{expected_role}}",
                &ctx,
                &scope(),
                &interpolator,
                &sandbox,
                &InterpolationOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(value, json!("admin"));
    }
}
