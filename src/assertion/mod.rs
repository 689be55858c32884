//! Assertion engine.
//!
//! Checks are pluggable strategies registered at startup: each declares
//! `can_handle` over a check descriptor and validates the resolved
//! actual value. A field passes iff every strategy claiming its check
//! passes; the step passes iff every field passes.

pub mod strategies;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::capture::jmespath_search;
use crate::http::HttpResponse;
use crate::suite::{AssertSpec, CheckSpec};

/// Outcome of one operator applied to one field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionResult {
    /// Field the check targeted (`status_code`, `headers.x`, `body.y`)
    pub field: String,
    /// Operator name
    pub operator: String,
    /// Expected value
    pub expected: Value,
    /// Actual value (null when the path did not resolve)
    pub actual: Value,
    /// Whether the check held
    pub passed: bool,
    /// Human-readable outcome
    pub message: String,
}

impl AssertionResult {
    /// Build a result, deriving the message from the outcome.
    #[must_use]
    pub fn new(
        field: &str,
        operator: &str,
        expected: Value,
        actual: Value,
        passed: bool,
    ) -> Self {
        let message = if passed {
            format!("{field} {operator} {}", render(&expected))
        } else {
            format!(
                "Assertion failed: {field} {operator} {}, got {}",
                render(&expected),
                render(&actual)
            )
        };
        Self {
            field: field.to_string(),
            operator: operator.to_string(),
            expected,
            actual,
            passed,
            message,
        }
    }
}

/// Compact rendering used in assertion messages.
pub(crate) fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Input to a strategy: one field, its check descriptor and the resolved
/// actual value (`None` when the path did not resolve).
pub struct CheckContext<'a> {
    /// Field label
    pub field: &'a str,
    /// The declared check
    pub check: &'a CheckSpec,
    /// Resolved actual value
    pub actual: Option<&'a Value>,
}

/// One assertion operator.
pub trait AssertionStrategy: Send + Sync {
    /// Operator name.
    fn name(&self) -> &'static str;

    /// Whether the check descriptor declares this operator.
    fn can_handle(&self, check: &CheckSpec) -> bool;

    /// Validate the actual value. `None` when the operator is absent.
    fn validate(&self, ctx: &CheckContext<'_>) -> Option<AssertionResult>;
}

/// Strategy registry + evaluation entry points.
pub struct AssertionEngine {
    strategies: Vec<Box<dyn AssertionStrategy>>,
}

impl Default for AssertionEngine {
    fn default() -> Self {
        Self::with_default_strategies()
    }
}

impl AssertionEngine {
    /// Engine seeded with every built-in operator.
    #[must_use]
    pub fn with_default_strategies() -> Self {
        Self {
            strategies: strategies::defaults(),
        }
    }

    /// Register an additional strategy.
    pub fn register(&mut self, strategy: Box<dyn AssertionStrategy>) {
        self.strategies.push(strategy);
    }

    /// Apply every claiming strategy to one field.
    #[must_use]
    pub fn check_field(
        &self,
        field: &str,
        check: &CheckSpec,
        actual: Option<&Value>,
    ) -> Vec<AssertionResult> {
        let ctx = CheckContext {
            field,
            check,
            actual,
        };
        self.strategies
            .iter()
            .filter(|s| s.can_handle(check))
            .filter_map(|s| s.validate(&ctx))
            .collect()
    }

    /// Evaluate a full assert spec against a response.
    #[must_use]
    pub fn evaluate(&self, spec: &AssertSpec, response: &HttpResponse) -> Vec<AssertionResult> {
        let mut results = Vec::new();

        if let Some(ref check) = spec.status_code {
            let actual = json!(response.status);
            results.extend(self.check_field("status_code", check, Some(&actual)));
        }

        for (name, check) in &spec.headers {
            let actual = response.header(name).map(|v| Value::String(v.to_string()));
            results.extend(self.check_field(
                &format!("headers.{name}"),
                check,
                actual.as_ref(),
            ));
        }

        for (path, check) in &spec.body {
            let field = format!("body.{path}");
            match jmespath_search(path, &response.body) {
                Ok(Value::Null) => results.extend(self.check_field(&field, check, None)),
                Ok(actual) => results.extend(self.check_field(&field, check, Some(&actual))),
                Err(err) => results.push(AssertionResult::new(
                    &field,
                    "path",
                    Value::String(path.clone()),
                    Value::String(err.to_string()),
                    false,
                )),
            }
        }

        if let Some(ref check) = spec.response_time_ms {
            let actual = json!(response.response_time_ms);
            results.extend(self.check_field("response_time_ms", check, Some(&actual)));
        }

        results
    }
}
