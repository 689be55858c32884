//! Error types for the flow-test engine

use std::io;

use thiserror::Error;

/// Result type alias for the flow-test engine
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (invalid file, schema violation, missing field)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Discovery error (unreadable file, permission denied)
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Circular `depends_on` chain between suites
    #[error("Circular dependency: {0}")]
    CircularDependency(String),

    /// Variable not found in any scope layer
    #[error("Variable not found: {0}")]
    NotFound(String),

    /// Expression mixes syntax categories outside `{{...}}` braces
    #[error("Mixed expression syntax: {0}")]
    MixedSyntax(String),

    /// Interpolation did not reach a fixed point within the pass budget
    #[error("Interpolation loop limit exceeded while resolving: {0}")]
    InterpolationLoop(String),

    /// Unresolved variable under `strict_vars`
    #[error("Unresolved variable: {0}")]
    UnresolvedVariable(String),

    /// Script rejected before evaluation (forbidden token, too long)
    #[error("JavaScript validation failed: {0}")]
    JsValidation(String),

    /// Script threw or failed during evaluation
    #[error("JavaScript runtime error: {0}")]
    JsRuntime(String),

    /// Script exceeded its wall-clock budget
    #[error("JavaScript evaluation timed out after {0}ms")]
    JsTimeout(u64),

    /// Script exceeded the sandbox memory cap
    #[error("JavaScript evaluation exceeded the memory limit")]
    JsMemory,

    /// Faker generation failed (unknown category/method, bad args)
    #[error("Faker error: {0}")]
    Faker(String),

    /// HTTP request exceeded its timeout
    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    /// TCP connection refused by the target
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Hostname resolution failed
    #[error("DNS resolution failed: {0}")]
    DnsFailure(String),

    /// TLS handshake or certificate failure
    #[error("TLS failure: {0}")]
    TlsFailure(String),

    /// Malformed HTTP exchange
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Response body exceeded the size cap
    #[error("Response exceeded {limit} bytes")]
    ResponseTooLarge {
        /// Configured maximum body size
        limit: u64,
    },

    /// An assertion did not hold
    #[error("Assertion failed: {field} {operator} {expected}, got {actual}")]
    AssertionFailed {
        /// Field the check targeted
        field: String,
        /// Operator name
        operator: String,
        /// Expected value (rendered)
        expected: String,
        /// Actual value (rendered)
        actual: String,
    },

    /// A capture expression failed to produce a value
    #[error("Capture '{name}' failed: {source}")]
    CaptureFailed {
        /// Target variable name
        name: String,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },

    /// Cross-suite call nesting exceeded the depth limit
    #[error("Maximum call depth exceeded at depth {depth}: {chain}")]
    MaxCallDepthExceeded {
        /// Nesting level that tripped the limit
        depth: usize,
        /// The call chain, outermost first
        chain: String,
    },

    /// Call target is already on the call stack
    #[error("Circular call detected: {0}")]
    CircularCall(String),

    /// Call or dependency target does not exist
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    /// A `validate` hook action with severity `error` failed
    #[error("Hook validation failed: {0}")]
    HookValidationFailed(String),

    /// Required input could not be collected
    #[error("Input error: {0}")]
    InputError(String),

    /// Execution was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short machine-readable kind tag, used in bus event metadata.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration",
            Self::Discovery(_) => "discovery",
            Self::CircularDependency(_) => "circular_dependency",
            Self::NotFound(_) => "not_found",
            Self::MixedSyntax(_) => "mixed_syntax",
            Self::InterpolationLoop(_) => "interpolation_loop",
            Self::UnresolvedVariable(_) => "unresolved_variable",
            Self::JsValidation(_) => "js_validation",
            Self::JsRuntime(_) => "js_runtime",
            Self::JsTimeout(_) => "js_timeout",
            Self::JsMemory => "js_memory",
            Self::Faker(_) => "faker",
            Self::Timeout(_) => "timeout",
            Self::ConnectionRefused(_) => "connection_refused",
            Self::DnsFailure(_) => "dns_failure",
            Self::TlsFailure(_) => "tls_failure",
            Self::ProtocolError(_) => "protocol_error",
            Self::ResponseTooLarge { .. } => "response_too_large",
            Self::AssertionFailed { .. } => "assertion_failed",
            Self::CaptureFailed { .. } => "capture_failed",
            Self::MaxCallDepthExceeded { .. } => "max_call_depth_exceeded",
            Self::CircularCall(_) => "circular_call",
            Self::TargetNotFound(_) => "target_not_found",
            Self::HookValidationFailed(_) => "hook_validation_failed",
            Self::InputError(_) => "input_error",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Yaml(_) => "yaml",
            Self::Http(_) => "http",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether a retry budget may absorb this error (network-transient).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::ConnectionRefused(_)
                | Self::DnsFailure(_)
                | Self::Http(_)
                | Self::Io(_)
        )
    }

    /// Whether this error aborts the run before any suite executes.
    #[must_use]
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::Discovery(_)
                | Self::CircularDependency(_)
                | Self::Yaml(_)
        )
    }
}

/// Process exit codes reported by the CLI.
pub mod exit_codes {
    /// All suites passed
    pub const SUCCESS: u8 = 0;
    /// At least one assertion or step failed
    pub const TEST_FAILURE: u8 = 1;
    /// Configuration or discovery error
    pub const CONFIG_ERROR: u8 = 2;
    /// Cancelled or timed out
    pub const CANCELLED: u8 = 3;
    /// Internal error
    pub const INTERNAL_ERROR: u8 = 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_cover_network_failures() {
        assert!(Error::Timeout(500).is_transient());
        assert!(Error::ConnectionRefused("127.0.0.1:1".into()).is_transient());
        assert!(Error::DnsFailure("nope.invalid".into()).is_transient());
        assert!(!Error::JsMemory.is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn assertion_failure_message_format() {
        let err = Error::AssertionFailed {
            field: "body.id".into(),
            operator: "equals".into(),
            expected: "1".into(),
            actual: "2".into(),
        };
        assert_eq!(err.to_string(), "Assertion failed: body.id equals 1, got 2");
    }

    #[test]
    fn setup_errors_abort_before_execution() {
        assert!(Error::Config("bad".into()).is_setup_error());
        assert!(Error::CircularDependency("a -> b -> a".into()).is_setup_error());
        assert!(!Error::Timeout(1).is_setup_error());
    }
}
