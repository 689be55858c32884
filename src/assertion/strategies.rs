//! Built-in assertion operators.

use regex::RegexBuilder;
use serde_json::{json, Value};

use crate::suite::{CheckSpec, LengthCheck};

use super::{AssertionResult, AssertionStrategy, CheckContext};

/// The default strategy set, in registration order.
#[must_use]
pub fn defaults() -> Vec<Box<dyn AssertionStrategy>> {
    vec![
        Box::new(Equals),
        Box::new(NotEquals),
        Box::new(Contains),
        Box::new(NotContains),
        Box::new(GreaterThan),
        Box::new(LessThan),
        Box::new(GreaterThanOrEqual),
        Box::new(LessThanOrEqual),
        Box::new(Within),
        Box::new(NotIn),
        Box::new(Pattern),
        Box::new(Exists),
        Box::new(NotEmpty),
        Box::new(Length),
        Box::new(TypeOf),
    ]
}

/// Deep structural equality, numeric-representation agnostic
/// (`1 == 1.0`), type-sensitive otherwise.
pub(crate) fn deep_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            // NaN never equals NaN.
            (Some(fx), Some(fy)) => fx == fy,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| deep_eq(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| deep_eq(x, y)))
        }
        _ => a == b,
    }
}

fn actual_or_null(ctx: &CheckContext<'_>) -> Value {
    ctx.actual.cloned().unwrap_or(Value::Null)
}

fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// JSON type name used by the `type` operator.
fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Numeric comparison shared by the four ordering operators.
/// Non-numeric operands fail.
fn numeric_check(
    name: &'static str,
    ctx: &CheckContext<'_>,
    expected: &Value,
    op: fn(f64, f64) -> bool,
) -> AssertionResult {
    let actual = actual_or_null(ctx);
    let passed = match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(e)) => op(a, e),
        _ => false,
    };
    AssertionResult::new(ctx.field, name, expected.clone(), actual, passed)
}

struct Equals;

impl AssertionStrategy for Equals {
    fn name(&self) -> &'static str {
        "equals"
    }

    fn can_handle(&self, check: &CheckSpec) -> bool {
        check.equals.is_some()
    }

    fn validate(&self, ctx: &CheckContext<'_>) -> Option<AssertionResult> {
        let expected = ctx.check.equals.as_ref()?;
        let actual = actual_or_null(ctx);
        let passed = deep_eq(&actual, expected);
        Some(AssertionResult::new(
            ctx.field,
            self.name(),
            expected.clone(),
            actual,
            passed,
        ))
    }
}

struct NotEquals;

impl AssertionStrategy for NotEquals {
    fn name(&self) -> &'static str {
        "not_equals"
    }

    fn can_handle(&self, check: &CheckSpec) -> bool {
        check.not_equals.is_some()
    }

    fn validate(&self, ctx: &CheckContext<'_>) -> Option<AssertionResult> {
        let expected = ctx.check.not_equals.as_ref()?;
        let actual = actual_or_null(ctx);
        let passed = !deep_eq(&actual, expected);
        Some(AssertionResult::new(
            ctx.field,
            self.name(),
            expected.clone(),
            actual,
            passed,
        ))
    }
}

/// Containment: substring for strings, deep-equality membership for
/// arrays, value membership for maps. Other actual types fail.
fn contains_value(actual: &Value, needle: &Value) -> Option<bool> {
    match actual {
        Value::String(s) => Some(s.contains(&coerce_string(needle))),
        Value::Array(items) => Some(items.iter().any(|item| deep_eq(item, needle))),
        Value::Object(map) => Some(map.values().any(|item| deep_eq(item, needle))),
        _ => None,
    }
}

struct Contains;

impl AssertionStrategy for Contains {
    fn name(&self) -> &'static str {
        "contains"
    }

    fn can_handle(&self, check: &CheckSpec) -> bool {
        check.contains.is_some()
    }

    fn validate(&self, ctx: &CheckContext<'_>) -> Option<AssertionResult> {
        let expected = ctx.check.contains.as_ref()?;
        let actual = actual_or_null(ctx);
        let passed = contains_value(&actual, expected).unwrap_or(false);
        Some(AssertionResult::new(
            ctx.field,
            self.name(),
            expected.clone(),
            actual,
            passed,
        ))
    }
}

struct NotContains;

impl AssertionStrategy for NotContains {
    fn name(&self) -> &'static str {
        "not_contains"
    }

    fn can_handle(&self, check: &CheckSpec) -> bool {
        check.not_contains.is_some()
    }

    fn validate(&self, ctx: &CheckContext<'_>) -> Option<AssertionResult> {
        let expected = ctx.check.not_contains.as_ref()?;
        let actual = actual_or_null(ctx);
        // A non-containable type cannot "not contain" anything either.
        let passed = contains_value(&actual, expected).map(|c| !c).unwrap_or(false);
        Some(AssertionResult::new(
            ctx.field,
            self.name(),
            expected.clone(),
            actual,
            passed,
        ))
    }
}

struct GreaterThan;

impl AssertionStrategy for GreaterThan {
    fn name(&self) -> &'static str {
        "greater_than"
    }

    fn can_handle(&self, check: &CheckSpec) -> bool {
        check.greater_than.is_some()
    }

    fn validate(&self, ctx: &CheckContext<'_>) -> Option<AssertionResult> {
        let expected = ctx.check.greater_than.as_ref()?;
        Some(numeric_check(self.name(), ctx, expected, |a, e| a > e))
    }
}

struct LessThan;

impl AssertionStrategy for LessThan {
    fn name(&self) -> &'static str {
        "less_than"
    }

    fn can_handle(&self, check: &CheckSpec) -> bool {
        check.less_than.is_some()
    }

    fn validate(&self, ctx: &CheckContext<'_>) -> Option<AssertionResult> {
        let expected = ctx.check.less_than.as_ref()?;
        Some(numeric_check(self.name(), ctx, expected, |a, e| a < e))
    }
}

struct GreaterThanOrEqual;

impl AssertionStrategy for GreaterThanOrEqual {
    fn name(&self) -> &'static str {
        "greater_than_or_equal"
    }

    fn can_handle(&self, check: &CheckSpec) -> bool {
        check.greater_than_or_equal.is_some()
    }

    fn validate(&self, ctx: &CheckContext<'_>) -> Option<AssertionResult> {
        let expected = ctx.check.greater_than_or_equal.as_ref()?;
        Some(numeric_check(self.name(), ctx, expected, |a, e| a >= e))
    }
}

struct LessThanOrEqual;

impl AssertionStrategy for LessThanOrEqual {
    fn name(&self) -> &'static str {
        "less_than_or_equal"
    }

    fn can_handle(&self, check: &CheckSpec) -> bool {
        check.less_than_or_equal.is_some()
    }

    fn validate(&self, ctx: &CheckContext<'_>) -> Option<AssertionResult> {
        let expected = ctx.check.less_than_or_equal.as_ref()?;
        Some(numeric_check(self.name(), ctx, expected, |a, e| a <= e))
    }
}

struct Within;

impl AssertionStrategy for Within {
    fn name(&self) -> &'static str {
        "in"
    }

    fn can_handle(&self, check: &CheckSpec) -> bool {
        check.within.is_some()
    }

    fn validate(&self, ctx: &CheckContext<'_>) -> Option<AssertionResult> {
        let expected = ctx.check.within.as_ref()?;
        let actual = actual_or_null(ctx);
        let passed = expected.iter().any(|candidate| deep_eq(candidate, &actual));
        Some(AssertionResult::new(
            ctx.field,
            self.name(),
            json!(expected),
            actual,
            passed,
        ))
    }
}

struct NotIn;

impl AssertionStrategy for NotIn {
    fn name(&self) -> &'static str {
        "not_in"
    }

    fn can_handle(&self, check: &CheckSpec) -> bool {
        check.not_in.is_some()
    }

    fn validate(&self, ctx: &CheckContext<'_>) -> Option<AssertionResult> {
        let expected = ctx.check.not_in.as_ref()?;
        let actual = actual_or_null(ctx);
        let passed = !expected.iter().any(|candidate| deep_eq(candidate, &actual));
        Some(AssertionResult::new(
            ctx.field,
            self.name(),
            json!(expected),
            actual,
            passed,
        ))
    }
}

/// `regex` / `pattern`: the actual value is coerced to a string and
/// matched against an ECMA-flavor pattern. `/body/flags` form carries
/// `i`, `m` and `s` flags.
struct Pattern;

impl Pattern {
    fn compile(pattern: &str) -> Result<regex::Regex, regex::Error> {
        let (body, flags) = if pattern.len() >= 2 && pattern.starts_with('/') {
            match pattern.rfind('/') {
                Some(end) if end > 0 => (&pattern[1..end], &pattern[end + 1..]),
                _ => (pattern, ""),
            }
        } else {
            (pattern, "")
        };

        RegexBuilder::new(body)
            .case_insensitive(flags.contains('i'))
            .multi_line(flags.contains('m'))
            .dot_matches_new_line(flags.contains('s'))
            .build()
    }
}

impl AssertionStrategy for Pattern {
    fn name(&self) -> &'static str {
        "regex"
    }

    fn can_handle(&self, check: &CheckSpec) -> bool {
        check.regex.is_some()
    }

    fn validate(&self, ctx: &CheckContext<'_>) -> Option<AssertionResult> {
        let pattern = ctx.check.regex.as_ref()?;
        let actual = actual_or_null(ctx);
        let haystack = coerce_string(&actual);
        let passed = match Self::compile(pattern) {
            Ok(re) => re.is_match(&haystack),
            Err(_) => false,
        };
        Some(AssertionResult::new(
            ctx.field,
            self.name(),
            Value::String(pattern.clone()),
            actual,
            passed,
        ))
    }
}

struct Exists;

impl AssertionStrategy for Exists {
    fn name(&self) -> &'static str {
        "exists"
    }

    fn can_handle(&self, check: &CheckSpec) -> bool {
        check.exists.is_some()
    }

    fn validate(&self, ctx: &CheckContext<'_>) -> Option<AssertionResult> {
        let expected = ctx.check.exists?;
        let resolved = ctx.actual.is_some_and(|v| !v.is_null());
        let passed = resolved == expected;
        Some(AssertionResult::new(
            ctx.field,
            self.name(),
            json!(expected),
            actual_or_null(ctx),
            passed,
        ))
    }
}

struct NotEmpty;

impl AssertionStrategy for NotEmpty {
    fn name(&self) -> &'static str {
        "not_empty"
    }

    fn can_handle(&self, check: &CheckSpec) -> bool {
        check.not_empty.is_some()
    }

    fn validate(&self, ctx: &CheckContext<'_>) -> Option<AssertionResult> {
        let expected = ctx.check.not_empty?;
        let actual = actual_or_null(ctx);
        let non_empty = !is_empty_value(&actual);
        let passed = non_empty == expected;
        Some(AssertionResult::new(
            ctx.field,
            self.name(),
            json!(expected),
            actual,
            passed,
        ))
    }
}

/// `length`: numeric comparison against the length of strings, arrays
/// or map key sets.
struct Length;

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

impl AssertionStrategy for Length {
    fn name(&self) -> &'static str {
        "length"
    }

    fn can_handle(&self, check: &CheckSpec) -> bool {
        check.length.is_some()
    }

    #[allow(clippy::cast_precision_loss)]
    fn validate(&self, ctx: &CheckContext<'_>) -> Option<AssertionResult> {
        let check = ctx.check.length.as_ref()?;
        let actual = actual_or_null(ctx);
        let Some(len) = length_of(&actual) else {
            return Some(AssertionResult::new(
                ctx.field,
                self.name(),
                expected_of_length_check(check),
                actual,
                false,
            ));
        };
        let len = len as f64;

        let passed = match check {
            LengthCheck::Exact(expected) => len == *expected,
            LengthCheck::Nested(ops) => {
                let mut holds = true;
                if let Some(e) = ops.equals.as_ref().and_then(Value::as_f64) {
                    holds &= len == e;
                }
                if let Some(e) = ops.not_equals.as_ref().and_then(Value::as_f64) {
                    holds &= len != e;
                }
                if let Some(e) = ops.greater_than.as_ref().and_then(Value::as_f64) {
                    holds &= len > e;
                }
                if let Some(e) = ops.less_than.as_ref().and_then(Value::as_f64) {
                    holds &= len < e;
                }
                if let Some(e) = ops.greater_than_or_equal.as_ref().and_then(Value::as_f64) {
                    holds &= len >= e;
                }
                if let Some(e) = ops.less_than_or_equal.as_ref().and_then(Value::as_f64) {
                    holds &= len <= e;
                }
                holds
            }
        };

        Some(AssertionResult::new(
            ctx.field,
            self.name(),
            expected_of_length_check(check),
            json!(len),
            passed,
        ))
    }
}

fn expected_of_length_check(check: &LengthCheck) -> Value {
    match check {
        LengthCheck::Exact(n) => json!(n),
        LengthCheck::Nested(ops) => serde_json::to_value(ops.as_ref()).unwrap_or(Value::Null),
    }
}

struct TypeOf;

impl AssertionStrategy for TypeOf {
    fn name(&self) -> &'static str {
        "type"
    }

    fn can_handle(&self, check: &CheckSpec) -> bool {
        check.value_type.is_some()
    }

    fn validate(&self, ctx: &CheckContext<'_>) -> Option<AssertionResult> {
        let expected = ctx.check.value_type.as_ref()?;
        let actual = actual_or_null(ctx);
        let passed = json_type(&actual) == expected.to_ascii_lowercase();
        Some(AssertionResult::new(
            ctx.field,
            self.name(),
            Value::String(expected.clone()),
            Value::String(json_type(&actual).to_string()),
            passed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion::AssertionEngine;
    use crate::suite::CheckSpec;

    fn check(yaml: &str) -> CheckSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn run(yaml: &str, actual: Option<&Value>) -> Vec<AssertionResult> {
        AssertionEngine::with_default_strategies().check_field("f", &check(yaml), actual)
    }

    fn passes(yaml: &str, actual: &Value) -> bool {
        run(yaml, Some(actual)).iter().all(|r| r.passed)
    }

    #[test]
    fn equals_is_deep_and_numeric_tolerant() {
        assert!(passes("equals: { a: [1, 2] }", &json!({"a": [1, 2]})));
        assert!(passes("equals: 1", &json!(1.0)));
        assert!(!passes("equals: '1'", &json!(1)));
    }

    #[test]
    fn contains_covers_strings_arrays_and_maps() {
        assert!(passes("contains: ell", &json!("hello")));
        assert!(passes("contains: 2", &json!([1, 2, 3])));
        assert!(passes("contains: ada", &json!({"user": "ada"})));
        assert!(!passes("contains: x", &json!(42)));
    }

    #[test]
    fn empty_substring_matches_any_string() {
        assert!(passes("contains: ''", &json!("anything")));
        assert!(passes("contains: ''", &json!("")));
    }

    #[test]
    fn ordering_operators_are_numeric_only() {
        assert!(passes("greater_than: 1", &json!(2)));
        assert!(!passes("greater_than: 0", &json!(0)));
        assert!(!passes("greater_than: 1", &json!("2")));
        assert!(passes("less_than_or_equal: 2", &json!(2)));
    }

    #[test]
    fn membership_uses_deep_equality() {
        assert!(passes("in: [1, 2, 3]", &json!(2)));
        assert!(!passes("in: [1, 2, 3]", &json!(4)));
        assert!(passes("not_in: [1, 2, 3]", &json!(4)));
    }

    #[test]
    fn regex_supports_flags_form() {
        assert!(passes("regex: '^A[0-9]+$'", &json!("A123")));
        assert!(passes("pattern: '/hello/i'", &json!("HELLO world")));
        assert!(!passes("regex: '^x$'", &json!("y")));
    }

    #[test]
    fn regex_coerces_non_strings() {
        assert!(passes("regex: '^12[0-9]$'", &json!(123)));
    }

    #[test]
    fn exists_tracks_path_resolution() {
        assert!(passes("exists: true", &json!("present")));
        assert!(run("exists: true", None).iter().all(|r| !r.passed));
        assert!(run("exists: false", None).iter().all(|r| r.passed));
    }

    #[test]
    fn not_empty_rejects_hollow_values() {
        assert!(passes("not_empty: true", &json!([1])));
        assert!(!passes("not_empty: true", &json!([])));
        assert!(!passes("not_empty: true", &json!("")));
        assert!(!passes("not_empty: true", &json!({})));
        assert!(run("not_empty: true", None).iter().all(|r| !r.passed));
    }

    #[test]
    fn length_zero_matches_all_empty_shapes() {
        assert!(passes("length: 0", &json!([])));
        assert!(passes("length: 0", &json!("")));
        assert!(passes("length: 0", &json!({})));
        assert!(!passes("length: 0", &json!([1])));
    }

    #[test]
    fn length_supports_nested_operators() {
        assert!(passes("length: { greater_than: 1, less_than: 4 }", &json!([1, 2])));
        assert!(!passes("length: { greater_than: 5 }", &json!([1, 2])));
    }

    #[test]
    fn type_check_matches_json_type_names() {
        assert!(passes("type: string", &json!("x")));
        assert!(passes("type: array", &json!([])));
        assert!(passes("type: 'null'", &Value::Null));
        assert!(!passes("type: number", &json!("3")));
    }
}
