//! Restricted JavaScript evaluation.
//!
//! Expressions are validated before they reach the interpreter, then run
//! in a fresh QuickJS context per evaluation on a blocking thread with a
//! wall-clock interrupt and a memory cap. Values cross the boundary as
//! JSON in both directions.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rquickjs::{Context, Runtime};
use serde_json::Value;

use crate::{Error, Result};

/// Tokens rejected anywhere in a script.
const FORBIDDEN_TOKENS: &[&str] = &[
    "require",
    "import",
    "eval",
    "Function",
    "constructor",
    "prototype",
    "__proto__",
    "process",
    "global",
    "globalThis",
    "WebAssembly",
    "fetch",
    "XMLHttpRequest",
    "WebSocket",
];

/// Names reserved by the sandbox; scope variables never shadow these.
const INJECTED_NAMES: &[&str] = &[
    "variables", "captured", "response", "request", "env", "Math", "Date", "JSON", "String",
    "Number", "Boolean", "Array", "Object", "parseInt", "parseFloat", "isNaN", "isFinite",
    "Buffer", "console",
];

/// Prelude evaluated before every script: disables dynamic code paths,
/// installs the `Buffer.from` shim and the console stub.
const PRELUDE: &str = r#"
globalThis.eval = undefined;
globalThis.Function = undefined;
globalThis.__console_lines = [];
(function () {
    var record = function (level) {
        return function () {
            var parts = [];
            for (var i = 0; i < arguments.length; i++) parts.push(String(arguments[i]));
            __console_lines.push(level + ': ' + parts.join(' '));
        };
    };
    globalThis.console = {
        log: record('log'),
        info: record('info'),
        warn: record('warn'),
        error: record('error'),
        debug: record('debug')
    };
})();
(function () {
    var utf8 = function (str) {
        var out = [];
        for (var i = 0; i < str.length; i++) {
            var c = str.charCodeAt(i);
            if (c < 128) {
                out.push(c);
            } else if (c < 2048) {
                out.push(192 | (c >> 6), 128 | (c & 63));
            } else if (c >= 0xd800 && c < 0xdc00 && i + 1 < str.length) {
                var c2 = str.charCodeAt(++i);
                var u = 0x10000 + ((c - 0xd800) << 10) + (c2 - 0xdc00);
                out.push(240 | (u >> 18), 128 | ((u >> 12) & 63), 128 | ((u >> 6) & 63), 128 | (u & 63));
            } else {
                out.push(224 | (c >> 12), 128 | ((c >> 6) & 63), 128 | (c & 63));
            }
        }
        return out;
    };
    var CH = 'ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/';
    var b64 = function (bytes) {
        var out = '';
        for (var i = 0; i < bytes.length; i += 3) {
            var a = bytes[i], b = bytes[i + 1], c = bytes[i + 2];
            out += CH[a >> 2];
            out += CH[((a & 3) << 4) | (b === undefined ? 0 : b >> 4)];
            out += b === undefined ? '=' : CH[((b & 15) << 2) | (c === undefined ? 0 : c >> 6)];
            out += c === undefined ? '=' : CH[c & 63];
        }
        return out;
    };
    globalThis.Buffer = {
        from: function (input, encoding) {
            var str = String(input);
            return {
                length: str.length,
                toString: function (enc) {
                    if (enc === 'base64') return b64(utf8(str));
                    return str;
                }
            };
        }
    };
})();
"#;

/// Sandbox limits and switches.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock budget per evaluation.
    pub timeout: Duration,
    /// QuickJS heap cap in bytes.
    pub memory_limit: usize,
    /// Maximum accepted source length.
    pub max_source_len: usize,
    /// Maximum parenthesis nesting depth.
    pub max_paren_depth: usize,
    /// Forward `console.*` output to tracing.
    pub enable_console: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            memory_limit: 8 * 1024 * 1024,
            max_source_len: 2000,
            max_paren_depth: 20,
            enable_console: false,
        }
    }
}

/// Host values exposed to a script.
#[derive(Debug, Clone, Default)]
pub struct JsInputs {
    /// Visible scope variables (also bound as top-level identifiers).
    pub variables: BTreeMap<String, Value>,
    /// Step-local captures.
    pub captured: BTreeMap<String, Value>,
    /// Normalized HTTP response, when a request has run.
    pub response: Option<Value>,
    /// Resolved request spec, when a request has run.
    pub request: Option<Value>,
    /// Environment snapshot.
    pub env: BTreeMap<String, String>,
}

/// Restricted JavaScript evaluator.
#[derive(Debug, Clone, Default)]
pub struct JsSandbox {
    config: SandboxConfig,
}

impl JsSandbox {
    /// Create a sandbox with the given limits.
    #[must_use]
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Reject scripts that are too long, unbalanced, too deeply nested,
    /// or that contain forbidden tokens.
    ///
    /// # Errors
    ///
    /// Returns `JsValidation` describing the first violation.
    pub fn validate(&self, source: &str) -> Result<()> {
        if source.len() > self.config.max_source_len {
            return Err(Error::JsValidation(format!(
                "script exceeds {} characters",
                self.config.max_source_len
            )));
        }

        let mut depth = 0usize;
        let mut max_depth = 0usize;
        for c in source.chars() {
            match c {
                '(' => {
                    depth += 1;
                    max_depth = max_depth.max(depth);
                }
                ')' => {
                    depth = depth.checked_sub(1).ok_or_else(|| {
                        Error::JsValidation("imbalanced parentheses".to_string())
                    })?;
                }
                _ => {}
            }
        }
        if depth != 0 {
            return Err(Error::JsValidation("imbalanced parentheses".to_string()));
        }
        if max_depth > self.config.max_paren_depth {
            return Err(Error::JsValidation(format!(
                "parenthesis nesting exceeds {}",
                self.config.max_paren_depth
            )));
        }

        // Buffer.from is the only permitted Buffer surface.
        if source.contains("Buffer.alloc") {
            return Err(Error::JsValidation("forbidden token: Buffer.alloc".to_string()));
        }

        for token in FORBIDDEN_TOKENS {
            if contains_word(source, token) {
                return Err(Error::JsValidation(format!("forbidden token: {token}")));
            }
        }

        Ok(())
    }

    /// Evaluate a script against the given inputs.
    ///
    /// Plain expressions are evaluated as `return (expr)`; code blocks run
    /// inside a zero-argument function.
    ///
    /// # Errors
    ///
    /// `JsValidation` before evaluation, `JsRuntime` for thrown errors,
    /// `JsTimeout` / `JsMemory` when a limit is hit.
    pub async fn eval(&self, source: &str, code_block: bool, inputs: &JsInputs) -> Result<Value> {
        self.validate(source)?;

        let wrapped = if code_block {
            format!("(function() {{ {source} }})()")
        } else {
            format!("({source})")
        };

        let bindings = identifier_bindings(&inputs.variables);
        let payload = serde_json::json!({
            "variables": inputs.variables,
            "captured": inputs.captured,
            "response": inputs.response,
            "request": inputs.request,
            "env": inputs.env,
        });
        let payload_text = payload.to_string();
        let config = self.config.clone();

        let handle = tokio::task::spawn_blocking(move || -> Result<(Value, Vec<String>)> {
            run_script(&config, &wrapped, &payload_text, &bindings)
        });

        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = self.config.timeout.as_millis() as u64;
        match tokio::time::timeout(self.config.timeout + Duration::from_millis(250), handle).await {
            Err(_) => Err(Error::JsTimeout(timeout_ms)),
            Ok(Err(join_err)) => Err(Error::Internal(format!("sandbox thread failed: {join_err}"))),
            Ok(Ok(outcome)) => {
                let (value, console_lines) = outcome?;
                if self.config.enable_console {
                    for line in console_lines {
                        tracing::debug!(target: "flow_test::js", "{line}");
                    }
                }
                Ok(value)
            }
        }
    }

    /// Evaluate a script and reduce the result to a boolean.
    pub async fn eval_bool(&self, source: &str, code_block: bool, inputs: &JsInputs) -> Result<bool> {
        let value = self.eval(source, code_block, inputs).await?;
        Ok(is_truthy(&value))
    }
}

/// JSON truthiness: null, false, 0, "", [], {} are falsy.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(arr) => !arr.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Run one script in a fresh runtime. Blocking; called from `spawn_blocking`.
fn run_script(
    config: &SandboxConfig,
    wrapped: &str,
    payload_text: &str,
    bindings: &[(String, String)],
) -> Result<(Value, Vec<String>)> {
    let runtime = Runtime::new().map_err(|e| Error::JsRuntime(e.to_string()))?;
    runtime.set_memory_limit(config.memory_limit);

    let deadline = Instant::now() + config.timeout;
    runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));

    let context = Context::full(&runtime).map_err(|e| Error::JsRuntime(e.to_string()))?;
    let timeout = config.timeout;

    context.with(|ctx| -> Result<(Value, Vec<String>)> {
        let _: rquickjs::Value = ctx
            .eval(PRELUDE)
            .map_err(|e| Error::JsRuntime(format!("prelude failed: {e}")))?;

        let injected = ctx
            .json_parse(payload_text)
            .map_err(|e| Error::JsRuntime(format!("failed to inject context: {e}")))?;
        let injected = injected
            .into_object()
            .ok_or_else(|| Error::JsRuntime("context payload is not an object".to_string()))?;
        let globals = ctx.globals();
        for name in ["variables", "captured", "response", "request", "env"] {
            let value: rquickjs::Value = injected
                .get(name)
                .map_err(|e| Error::JsRuntime(e.to_string()))?;
            globals
                .set(name, value)
                .map_err(|e| Error::JsRuntime(e.to_string()))?;
        }

        // Identifier-named variables become top-level bindings.
        for (name, json) in bindings {
            let value = ctx
                .json_parse(json.as_str())
                .map_err(|e| Error::JsRuntime(e.to_string()))?;
            globals
                .set(name.as_str(), value)
                .map_err(|e| Error::JsRuntime(e.to_string()))?;
        }

        let result: rquickjs::Value = match ctx.eval(wrapped) {
            Ok(value) => value,
            Err(e) => return Err(map_eval_error(&ctx, &e, timeout)),
        };

        let value = match ctx.json_stringify(result) {
            Ok(Some(text)) => {
                let text = text
                    .to_string()
                    .map_err(|e| Error::JsRuntime(e.to_string()))?;
                serde_json::from_str(&text)?
            }
            // undefined (or unstringifiable) results collapse to null
            Ok(None) => Value::Null,
            Err(e) => return Err(Error::JsRuntime(e.to_string())),
        };

        let console_lines = read_console_lines(&ctx);
        Ok((value, console_lines))
    })
}

/// Translate an rquickjs evaluation error, distinguishing interrupt
/// (timeout) and out-of-memory conditions.
fn map_eval_error(ctx: &rquickjs::Ctx<'_>, error: &rquickjs::Error, timeout: Duration) -> Error {
    let thrown = ctx.catch();
    // Error objects stringify to "{}", so pull the message off the
    // exception itself before falling back to JSON.
    let description = if let Some(exception) = thrown.as_exception() {
        exception
            .message()
            .unwrap_or_else(|| error.to_string())
    } else if thrown.is_undefined() || thrown.is_null() {
        error.to_string()
    } else {
        ctx.json_stringify(thrown)
            .ok()
            .flatten()
            .and_then(|s| s.to_string().ok())
            .unwrap_or_else(|| error.to_string())
    };

    let lowered = description.to_lowercase();
    #[allow(clippy::cast_possible_truncation)]
    let timeout_ms = timeout.as_millis() as u64;
    if lowered.contains("interrupted") {
        Error::JsTimeout(timeout_ms)
    } else if lowered.contains("out of memory") {
        Error::JsMemory
    } else {
        Error::JsRuntime(description)
    }
}

fn read_console_lines(ctx: &rquickjs::Ctx<'_>) -> Vec<String> {
    let lines: std::result::Result<Vec<String>, _> = ctx.globals().get("__console_lines");
    lines.unwrap_or_default()
}

/// Serialize identifier-named variables for top-level injection.
fn identifier_bindings(variables: &BTreeMap<String, Value>) -> Vec<(String, String)> {
    variables
        .iter()
        .filter(|(name, _)| is_identifier(name) && !INJECTED_NAMES.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.to_string()))
        .collect()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Word-boundary containment check for forbidden tokens.
fn contains_word(source: &str, token: &str) -> bool {
    let mut start = 0;
    while let Some(pos) = source[start..].find(token) {
        let abs = start + pos;
        let before_ok = abs == 0
            || !source[..abs]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        let after = abs + token.len();
        let after_ok = after >= source.len()
            || !source[after..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
        if before_ok && after_ok {
            return true;
        }
        start = abs + token.len();
    }
    false
}
