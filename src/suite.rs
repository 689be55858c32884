//! Suite and step definitions.
//!
//! These types map directly to the YAML/JSON suite file format:
//!
//! ```text
//! node_id: auth
//! suite_name: Authentication
//! priority: high
//! depends_on: [setup]
//! variables: { user: admin }
//! exports: [token]
//! steps:
//!   - name: login
//!     request: { method: POST, url: "{{base_url}}/login" }
//!     assert: { status_code: { equals: 200 } }
//!     capture: { token: "@body.token" }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hooks::HookSet;
use crate::{Error, Result};

/// Scheduling priority of a suite.
///
/// Within a dependency layer, suites run critical-first; ties break on
/// discovery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Runs before everything else in its layer
    Critical,
    /// Elevated priority
    High,
    /// Default priority
    #[default]
    Medium,
    /// Runs last in its layer
    Low,
}

impl Priority {
    /// Ordering rank (lower runs first).
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

/// A test suite loaded from a `*.test.{yml,yaml}` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suite {
    /// Unique identifier across the discovered set.
    /// Derived from the file path when not declared explicitly.
    #[serde(default)]
    pub node_id: String,

    /// Human-readable suite name.
    pub suite_name: String,

    /// Base URL joined against relative step URLs.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,

    /// Node ids this suite depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Suite-level variables, interpolated against env + globals before step 0.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,

    /// Variable names promoted to the global export table on success.
    #[serde(default)]
    pub exports: Vec<String>,

    /// Free-form tags used by run filters.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Suite-level default for steps that don't set `continue_on_failure`.
    #[serde(default)]
    pub continue_on_failure: Option<bool>,

    /// Ordered execution steps.
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Source file this suite was loaded from.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,

    /// Position in discovery order (tie-breaker for scheduling).
    #[serde(skip)]
    pub discovery_index: usize,
}

impl Suite {
    /// Validate structural constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for duplicate step names or a step
    /// with more than one primary action.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(Error::Config(format!(
                    "Duplicate step name '{}' in suite '{}'",
                    step.name, self.node_id
                )));
            }
            step.validate(&self.node_id)?;
        }
        Ok(())
    }

    /// Find a step by name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// A single unit of work inside a suite.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Step {
    /// Step name, unique within the suite.
    pub name: String,

    /// HTTP request to execute (primary action).
    #[serde(default)]
    pub request: Option<RequestSpec>,

    /// Values to collect before the request (primary action).
    #[serde(default)]
    pub input: Option<Vec<InputSpec>>,

    /// Cross-suite/step invocation (primary action).
    #[serde(default)]
    pub call: Option<CallSpec>,

    /// Wraps the step in N executions.
    #[serde(default)]
    pub iterate: Option<IterateSpec>,

    /// Skip the step when this JavaScript expression is falsy.
    #[serde(default)]
    pub condition: Option<String>,

    /// Response checks.
    #[serde(default)]
    pub assert: Option<AssertSpec>,

    /// Target variable name -> source expression.
    #[serde(default)]
    pub capture: Option<BTreeMap<String, String>>,

    /// Lifecycle hook actions.
    #[serde(default)]
    pub hooks: Option<HookSet>,

    /// Conditional assertion/capture branches; first matching condition wins.
    #[serde(default)]
    pub scenarios: Vec<Scenario>,

    /// Keep the suite going when this step fails.
    #[serde(default)]
    pub continue_on_failure: Option<bool>,

    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: Option<RetrySpec>,

    /// Optional per-step wall-clock budget in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Step {
    fn validate(&self, suite_id: &str) -> Result<()> {
        let actions = [
            self.request.is_some(),
            self.call.is_some(),
            self.input.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();
        if actions > 1 {
            return Err(Error::Config(format!(
                "Step '{}' in suite '{}' declares more than one of request/call/input",
                self.name, suite_id
            )));
        }
        if let Some(ref iterate) = self.iterate {
            iterate.validate(&self.name)?;
        }
        Ok(())
    }
}

/// HTTP request specification.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RequestSpec {
    /// HTTP method (GET, POST, ...).
    pub method: String,

    /// Absolute URL, or a path joined against the suite `base_url`.
    pub url: String,

    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Query string parameters.
    #[serde(default)]
    pub query: BTreeMap<String, Value>,

    /// JSON request body.
    #[serde(default)]
    pub body: Option<Value>,

    /// Per-request timeout override.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// TLS client configuration.
    #[serde(default)]
    pub tls: Option<TlsSpec>,
}

/// TLS client material and protocol bounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct TlsSpec {
    /// Minimum protocol version (`TLSv1` .. `TLSv1.3`).
    #[serde(default)]
    pub min_version: Option<String>,

    /// Maximum protocol version.
    #[serde(default)]
    pub max_version: Option<String>,

    /// PEM client certificate path (paired with `key_path`).
    #[serde(default, alias = "cert")]
    pub cert_path: Option<String>,

    /// PEM private key path.
    #[serde(default, alias = "key")]
    pub key_path: Option<String>,

    /// PKCS#12 archive path.
    #[serde(default, alias = "pfx")]
    pub pfx_path: Option<String>,

    /// Passphrase for the key or archive.
    #[serde(default)]
    pub passphrase: Option<String>,

    /// Extra CA bundle (PEM) to trust.
    #[serde(default, alias = "ca")]
    pub ca_path: Option<String>,

    /// Verify the server certificate (default true).
    #[serde(default)]
    pub verify: Option<bool>,
}

/// Iteration wrapper: run the step N times, or once per element.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IterateSpec {
    /// Fixed iteration count.
    #[serde(default)]
    pub count: Option<u64>,

    /// Expression resolving to an array to iterate over.
    #[serde(default)]
    pub over: Option<String>,
}

impl IterateSpec {
    fn validate(&self, step_name: &str) -> Result<()> {
        if self.count.is_none() && self.over.is_none() {
            return Err(Error::Config(format!(
                "Step '{step_name}': iterate requires either 'count' or 'over'"
            )));
        }
        Ok(())
    }
}

/// Cross-suite/step invocation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CallSpec {
    /// Step name, `node_id`, or `node_id.step_name`.
    pub target: String,

    /// Arguments merged into the callee scope.
    #[serde(default)]
    pub with: BTreeMap<String, Value>,

    /// Names to propagate back; defaults to the callee's exports,
    /// falling back to all captures.
    #[serde(default)]
    pub propagate: Option<Vec<String>>,
}

/// Input collection field.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InputSpec {
    /// Variable name the collected value binds to.
    pub name: String,

    /// Declared value type (informational).
    #[serde(default, rename = "type")]
    pub value_type: Option<String>,

    /// Prompt shown in interactive mode.
    #[serde(default)]
    pub prompt: Option<String>,

    /// Value used when running non-interactively.
    #[serde(default)]
    pub ci_default: Option<Value>,

    /// Whether the input must resolve to a value.
    #[serde(default)]
    pub required: bool,
}

/// Response checks grouped by target surface.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AssertSpec {
    /// Check against the response status code.
    #[serde(default)]
    pub status_code: Option<CheckSpec>,

    /// Checks against response headers by name.
    #[serde(default)]
    pub headers: BTreeMap<String, CheckSpec>,

    /// Checks against body paths (JMESPath relative to the body).
    #[serde(default)]
    pub body: BTreeMap<String, CheckSpec>,

    /// Check against the measured response time in milliseconds.
    #[serde(default)]
    pub response_time_ms: Option<CheckSpec>,
}

impl AssertSpec {
    /// Whether any check is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status_code.is_none()
            && self.headers.is_empty()
            && self.body.is_empty()
            && self.response_time_ms.is_none()
    }

    /// Merge another spec into this one (scenario checks on top of step checks).
    pub fn merge(&mut self, other: &Self) {
        if other.status_code.is_some() {
            self.status_code.clone_from(&other.status_code);
        }
        for (k, v) in &other.headers {
            self.headers.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.body {
            self.body.insert(k.clone(), v.clone());
        }
        if other.response_time_ms.is_some() {
            self.response_time_ms.clone_from(&other.response_time_ms);
        }
    }
}

/// Operator check descriptor. Multiple operators on one field are conjunctive.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CheckSpec {
    /// Deep structural equality.
    #[serde(default)]
    pub equals: Option<Value>,

    /// Deep structural inequality.
    #[serde(default)]
    pub not_equals: Option<Value>,

    /// Substring / membership / value containment.
    #[serde(default)]
    pub contains: Option<Value>,

    /// Negated containment.
    #[serde(default)]
    pub not_contains: Option<Value>,

    /// Numeric strictly-greater comparison.
    #[serde(default)]
    pub greater_than: Option<Value>,

    /// Numeric strictly-less comparison.
    #[serde(default)]
    pub less_than: Option<Value>,

    /// Numeric greater-or-equal comparison.
    #[serde(default)]
    pub greater_than_or_equal: Option<Value>,

    /// Numeric less-or-equal comparison.
    #[serde(default)]
    pub less_than_or_equal: Option<Value>,

    /// Membership in an array literal (deep equality).
    #[serde(default, rename = "in")]
    pub within: Option<Vec<Value>>,

    /// Negated membership.
    #[serde(default)]
    pub not_in: Option<Vec<Value>>,

    /// ECMA-flavor regular expression; `/body/flags` form supported.
    #[serde(default, alias = "pattern")]
    pub regex: Option<String>,

    /// Path resolution check.
    #[serde(default)]
    pub exists: Option<bool>,

    /// Non-null / non-empty check.
    #[serde(default)]
    pub not_empty: Option<bool>,

    /// Length comparison (exact number, or nested numeric operators).
    #[serde(default)]
    pub length: Option<LengthCheck>,

    /// JSON type name check.
    #[serde(default, rename = "type")]
    pub value_type: Option<String>,
}

/// Length check form: an exact number, or nested numeric operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LengthCheck {
    /// `length: 3`
    Exact(f64),
    /// `length: { greater_than: 0 }`
    Nested(Box<CheckSpec>),
}

/// Conditional assertion/capture branch evaluated after the response.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Scenario {
    /// Optional label used in results.
    #[serde(default)]
    pub name: Option<String>,

    /// JavaScript boolean expression over the response/context.
    pub condition: String,

    /// Checks applied when the condition matches.
    #[serde(default)]
    pub assert: Option<AssertSpec>,

    /// Captures applied when the condition matches.
    #[serde(default)]
    pub capture: Option<BTreeMap<String, String>>,
}

/// Retry policy: exponential backoff `delay * multiplier^(attempt-1)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySpec {
    /// Total attempt budget (first try included).
    pub max_attempts: u32,

    /// Initial backoff delay in milliseconds.
    pub delay_ms: u64,

    /// Backoff growth factor.
    pub multiplier: f64,

    /// Also retry assertion failures, not just network errors.
    pub on_assertion_failure: bool,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            multiplier: 2.0,
            on_assertion_failure: false,
        }
    }
}

impl RetrySpec {
    /// Backoff before the given attempt number (attempt 2 waits `delay_ms`).
    #[must_use]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(2);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = (self.delay_ms as f64 * self.multiplier.powi(exponent as i32)) as u64;
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(yaml: &str) -> Suite {
        serde_yaml::from_str(yaml).expect("valid suite yaml")
    }

    #[test]
    fn minimal_suite_parses_with_defaults() {
        let suite = parse("suite_name: Smoke\nsteps:\n  - name: ping\n");
        assert_eq!(suite.priority, Priority::Medium);
        assert!(suite.depends_on.is_empty());
        assert_eq!(suite.steps.len(), 1);
        assert!(suite.steps[0].request.is_none());
    }

    #[test]
    fn check_spec_accepts_operator_map() {
        let check: CheckSpec =
            serde_yaml::from_str("equals: 200\ngreater_than: 100\n").unwrap();
        assert_eq!(check.equals, Some(json!(200)));
        assert_eq!(check.greater_than, Some(json!(100)));
    }

    #[test]
    fn check_spec_rejects_unknown_operator() {
        let parsed: std::result::Result<CheckSpec, _> = serde_yaml::from_str("equal: 200\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn pattern_is_an_alias_for_regex() {
        let check: CheckSpec = serde_yaml::from_str("pattern: '^ab+$'\n").unwrap();
        assert_eq!(check.regex.as_deref(), Some("^ab+$"));
    }

    #[test]
    fn length_check_supports_exact_and_nested_forms() {
        let exact: CheckSpec = serde_yaml::from_str("length: 3\n").unwrap();
        assert!(matches!(exact.length, Some(LengthCheck::Exact(n)) if n == 3.0));

        let nested: CheckSpec =
            serde_yaml::from_str("length:\n  greater_than: 0\n").unwrap();
        assert!(matches!(nested.length, Some(LengthCheck::Nested(_))));
    }

    #[test]
    fn step_with_two_primary_actions_is_rejected() {
        let suite = parse(
            "suite_name: Bad\nsteps:\n  - name: both\n    request: { method: GET, url: /x }\n    call: { target: other }\n",
        );
        assert!(suite.validate().is_err());
    }

    #[test]
    fn duplicate_step_names_are_rejected() {
        let suite = parse(
            "suite_name: Dup\nsteps:\n  - name: a\n  - name: a\n",
        );
        assert!(suite.validate().is_err());
    }

    #[test]
    fn iterate_requires_count_or_over() {
        let suite = parse("suite_name: It\nsteps:\n  - name: loop\n    iterate: {}\n");
        assert!(suite.validate().is_err());
    }

    #[test]
    fn retry_defaults_follow_policy() {
        let retry = RetrySpec::default();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.delay_ms, 1000);
        assert_eq!(retry.delay_before(2), Duration::from_millis(1000));
        assert_eq!(retry.delay_before(3), Duration::from_millis(2000));
    }

    #[test]
    fn assert_merge_prefers_scenario_values() {
        let mut base: AssertSpec =
            serde_yaml::from_str("status_code: { equals: 200 }\nbody:\n  id: { exists: true }\n")
                .unwrap();
        let scenario: AssertSpec =
            serde_yaml::from_str("status_code: { equals: 404 }\n").unwrap();
        base.merge(&scenario);
        assert_eq!(base.status_code.unwrap().equals, Some(json!(404)));
        assert!(base.body.contains_key("id"));
    }
}
