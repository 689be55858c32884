//! Layered variable scope and the process-wide export table.
//!
//! Resolution order, highest precedence first:
//!
//! 1. runtime layers (hook/iteration vars, innermost first)
//! 2. step-local captures
//! 3. suite variables
//! 4. global exports (addressable as `<node_id>.<name>`)
//! 5. environment snapshot
//!
//! One scope exists per suite execution; the export table is shared
//! across the whole run behind an `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::{Error, Result};

/// Process-wide export table keyed by `(node_id, name)`.
///
/// Written once per suite on success; a second write for the same key
/// overwrites (callers emit a warning event when that happens).
#[derive(Debug, Default)]
pub struct GlobalExports {
    entries: DashMap<(String, String), Value>,
}

impl GlobalExports {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an export. Returns `true` when an existing value was overwritten.
    pub fn export(&self, suite_id: &str, name: &str, value: Value) -> bool {
        self.entries
            .insert((suite_id.to_string(), name.to_string()), value)
            .is_some()
    }

    /// Look up an export.
    #[must_use]
    pub fn get(&self, suite_id: &str, name: &str) -> Option<Value> {
        self.entries
            .get(&(suite_id.to_string(), name.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Snapshot of every export as `"<node_id>.<name>" -> value`.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries
            .iter()
            .map(|entry| {
                let (suite, name) = entry.key();
                (format!("{suite}.{name}"), entry.value().clone())
            })
            .collect()
    }

    /// Number of stored exports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One path segment: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Layered key/value store for one suite execution.
#[derive(Debug, Clone)]
pub struct VariableScope {
    env: Arc<HashMap<String, String>>,
    globals: Arc<GlobalExports>,
    suite_vars: HashMap<String, Value>,
    captures: HashMap<String, Value>,
    runtime: Vec<HashMap<String, Value>>,
}

impl VariableScope {
    /// Create a scope over the run's env snapshot and export table.
    #[must_use]
    pub fn new(env: Arc<HashMap<String, String>>, globals: Arc<GlobalExports>) -> Self {
        Self {
            env,
            globals,
            suite_vars: HashMap::new(),
            captures: HashMap::new(),
            runtime: Vec::new(),
        }
    }

    /// Resolve a plain (undotted) identifier through the layer stack.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        for layer in self.runtime.iter().rev() {
            if let Some(value) = layer.get(name) {
                return Some(value.clone());
            }
        }
        if let Some(value) = self.captures.get(name) {
            return Some(value.clone());
        }
        if let Some(value) = self.suite_vars.get(name) {
            return Some(value.clone());
        }
        self.env.get(name).map(|s| Value::String(s.clone()))
    }

    /// Bind a value in the innermost layer (top runtime layer, or the
    /// capture layer when none is pushed).
    pub fn set_local(&mut self, name: impl Into<String>, value: Value) {
        if let Some(layer) = self.runtime.last_mut() {
            layer.insert(name.into(), value);
        } else {
            self.captures.insert(name.into(), value);
        }
    }

    /// Bind a step-local capture.
    pub fn set_capture(&mut self, name: impl Into<String>, value: Value) {
        self.captures.insert(name.into(), value);
    }

    /// Bind a suite variable.
    pub fn set_suite_var(&mut self, name: impl Into<String>, value: Value) {
        self.suite_vars.insert(name.into(), value);
    }

    /// Push an ephemeral runtime layer.
    pub fn push_layer(&mut self) {
        self.runtime.push(HashMap::new());
    }

    /// Pop the innermost runtime layer. Bindings made in it disappear.
    pub fn pop_layer(&mut self) {
        self.runtime.pop();
    }

    /// Promote a value to the global export table.
    /// Returns `true` when an existing export was overwritten.
    pub fn export_global(&self, suite_id: &str, name: &str, value: Value) -> bool {
        self.globals.export(suite_id, name, value)
    }

    /// The shared export table.
    #[must_use]
    pub fn globals(&self) -> &Arc<GlobalExports> {
        &self.globals
    }

    /// The immutable env snapshot.
    #[must_use]
    pub fn env(&self) -> &Arc<HashMap<String, String>> {
        &self.env
    }

    /// Step-local captures accumulated so far.
    #[must_use]
    pub fn captures(&self) -> &HashMap<String, Value> {
        &self.captures
    }

    /// Every visible binding flattened into one map, innermost shadowing
    /// outermost. Used to seed JavaScript evaluation contexts.
    #[must_use]
    pub fn visible_variables(&self) -> BTreeMap<String, Value> {
        let mut merged = BTreeMap::new();
        for (name, value) in &self.suite_vars {
            merged.insert(name.clone(), value.clone());
        }
        for (name, value) in &self.captures {
            merged.insert(name.clone(), value.clone());
        }
        for layer in &self.runtime {
            for (name, value) in layer {
                merged.insert(name.clone(), value.clone());
            }
        }
        merged
    }

    /// Resolve a dotted path with bracket indexing and quoted segments,
    /// e.g. `a.b[0]."weird key".c`.
    ///
    /// A `<node_id>.<name>` prefix consults the export table before any
    /// local layer. Inner misses resolve to `null`; a missing top-level
    /// identifier is `NotFound`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no layer holds the leading identifier, or
    /// a configuration error for malformed paths.
    pub fn resolve_path(&self, path: &str) -> Result<Value> {
        let segments = parse_path(path)?;
        let Some(Segment::Key(first)) = segments.first() else {
            return Err(Error::Config(format!("Path cannot start with an index: {path}")));
        };

        if let Some(Segment::Key(second)) = segments.get(1) {
            if let Some(value) = self.globals.get(first, second) {
                return Ok(descend(&value, &segments[2..]));
            }
        }

        let root = self
            .get(first)
            .ok_or_else(|| Error::NotFound(first.clone()))?;
        Ok(descend(&root, &segments[1..]))
    }
}

/// Walk the remaining segments; missing branches yield `null`.
fn descend(root: &Value, segments: &[Segment]) -> Value {
    let mut current = root;
    for segment in segments {
        match segment {
            Segment::Key(key) => match current.get(key.as_str()) {
                Some(next) => current = next,
                None => return Value::Null,
            },
            Segment::Index(idx) => match current.get(idx) {
                Some(next) => current = next,
                None => return Value::Null,
            },
        }
    }
    current.clone()
}

/// Tokenize `a.b[0]."weird key".c` into segments.
fn parse_path(path: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let chars: Vec<char> = path.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                i += 1;
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .ok_or_else(|| Error::Config(format!("Unclosed bracket in path: {path}")))?;
                let inner: String = chars[i + 1..i + close].iter().collect();
                let inner = inner.trim();
                if let Some(quoted) = strip_quotes(inner) {
                    segments.push(Segment::Key(quoted.to_string()));
                } else {
                    let index = inner.parse::<usize>().map_err(|_| {
                        Error::Config(format!("Invalid index '{inner}' in path: {path}"))
                    })?;
                    segments.push(Segment::Index(index));
                }
                i += close + 1;
            }
            '"' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|c| *c == '"')
                    .ok_or_else(|| Error::Config(format!("Unclosed quote in path: {path}")))?;
                let key: String = chars[i + 1..=i + close].iter().collect();
                segments.push(Segment::Key(key));
                i += close + 2;
            }
            _ => {
                let start = i;
                while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                    i += 1;
                }
                let key: String = chars[start..i].iter().collect();
                if key.is_empty() {
                    return Err(Error::Config(format!("Empty segment in path: {path}")));
                }
                segments.push(Segment::Key(key));
            }
        }
    }

    if segments.is_empty() {
        return Err(Error::Config("Empty variable path".to_string()));
    }
    Ok(segments)
}

fn strip_quotes(s: &str) -> Option<&str> {
    s.strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .or_else(|| s.strip_prefix('\'').and_then(|rest| rest.strip_suffix('\'')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> VariableScope {
        let mut env = HashMap::new();
        env.insert("HOME_DIR".to_string(), "/home/test".to_string());
        VariableScope::new(Arc::new(env), Arc::new(GlobalExports::new()))
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut scope = scope();
        scope.set_local("count", json!(3));
        assert_eq!(scope.get("count"), Some(json!(3)));
    }

    #[test]
    fn popped_layer_restores_earlier_binding() {
        let mut scope = scope();
        scope.set_local("name", json!("outer"));
        scope.push_layer();
        scope.set_local("name", json!("inner"));
        assert_eq!(scope.get("name"), Some(json!("inner")));
        scope.pop_layer();
        assert_eq!(scope.get("name"), Some(json!("outer")));
    }

    #[test]
    fn runtime_layer_shadows_captures_and_suite_vars() {
        let mut scope = scope();
        scope.set_suite_var("who", json!("suite"));
        scope.set_capture("who", json!("capture"));
        assert_eq!(scope.get("who"), Some(json!("capture")));
        scope.push_layer();
        scope.set_local("who", json!("runtime"));
        assert_eq!(scope.get("who"), Some(json!("runtime")));
    }

    #[test]
    fn env_snapshot_is_the_lowest_layer() {
        let scope = scope();
        assert_eq!(scope.get("HOME_DIR"), Some(json!("/home/test")));
        assert_eq!(scope.get("MISSING"), None);
    }

    #[test]
    fn resolve_path_walks_structures() {
        let mut scope = scope();
        scope.set_local(
            "user",
            json!({"addresses": [{"city": "Oslo"}], "weird key": {"x": 1}}),
        );
        assert_eq!(
            scope.resolve_path("user.addresses[0].city").unwrap(),
            json!("Oslo")
        );
        assert_eq!(scope.resolve_path("user.\"weird key\".x").unwrap(), json!(1));
        assert_eq!(scope.resolve_path("user.missing.deeper").unwrap(), Value::Null);
    }

    #[test]
    fn resolve_path_missing_root_is_not_found() {
        let scope = scope();
        assert!(matches!(
            scope.resolve_path("ghost.field"),
            Err(Error::NotFound(name)) if name == "ghost"
        ));
    }

    #[test]
    fn dotted_lookup_prefers_global_exports() {
        let mut scope = scope();
        scope.set_local("auth", json!({"token": "local"}));
        scope.globals().export("auth", "token", json!("exported"));
        assert_eq!(scope.resolve_path("auth.token").unwrap(), json!("exported"));
    }

    #[test]
    fn export_overwrite_is_reported() {
        let scope = scope();
        assert!(!scope.export_global("suite-a", "token", json!("one")));
        assert!(scope.export_global("suite-a", "token", json!("two")));
        assert_eq!(scope.globals().get("suite-a", "token"), Some(json!("two")));
    }
}
