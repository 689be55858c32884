//! Execution core: per-step lifecycle, per-suite walk, cross-suite calls.

pub mod call;
pub mod step;
pub mod suite;

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::assertion::AssertionEngine;
use crate::bus::LogBus;
use crate::capture::CaptureEngine;
use crate::http::HttpInvoker;
use crate::interpolation::{InterpolationOptions, Interpolator};
use crate::sandbox::JsSandbox;
use crate::scope::GlobalExports;
use crate::suite::Suite;

/// Long-lived services shared by every execution in a run. Created and
/// owned by the orchestrator; no module-level state anywhere.
pub struct RunContext {
    /// Event bus
    pub bus: Arc<LogBus>,
    /// Global export table
    pub globals: Arc<GlobalExports>,
    /// Immutable env snapshot taken at run start
    pub env: Arc<HashMap<String, String>>,
    /// HTTP invoker
    pub invoker: Arc<HttpInvoker>,
    /// Interpolation service
    pub interpolator: Arc<Interpolator>,
    /// JS sandbox
    pub sandbox: Arc<JsSandbox>,
    /// Assertion engine
    pub assertions: Arc<AssertionEngine>,
    /// Capture engine
    pub captures: Arc<CaptureEngine>,
    /// Every discovered suite by node id (the call service's registry)
    pub suites: Arc<HashMap<String, Arc<Suite>>>,
    /// Run id
    pub run_id: String,
    /// Run-wide cancellation token
    pub cancel: CancellationToken,
    /// Interpolation switches
    pub options: InterpolationOptions,
    /// Run-level default for `continue_on_failure`
    pub default_continue_on_failure: bool,
}

impl RunContext {
    /// Assemble a context over the given suites and environment.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        bus: Arc<LogBus>,
        suites: Vec<Suite>,
        env: HashMap<String, String>,
    ) -> Self {
        let sandbox = Arc::new(JsSandbox::default());
        let interpolator =
            Arc::new(Interpolator::new(Arc::clone(&sandbox)).with_bus(Arc::clone(&bus)));
        let registry: HashMap<String, Arc<Suite>> = suites
            .into_iter()
            .map(|s| (s.node_id.clone(), Arc::new(s)))
            .collect();

        Self {
            bus,
            globals: Arc::new(GlobalExports::new()),
            env: Arc::new(env),
            invoker: Arc::new(HttpInvoker::new()),
            interpolator,
            sandbox,
            assertions: Arc::new(AssertionEngine::with_default_strategies()),
            captures: Arc::new(CaptureEngine::new()),
            suites: Arc::new(registry),
            run_id: run_id.into(),
            cancel: CancellationToken::new(),
            options: InterpolationOptions::default(),
            default_continue_on_failure: false,
        }
    }

    /// Set the strict-variables interpolation mode.
    #[must_use]
    pub fn with_strict_vars(mut self, strict: bool) -> Self {
        self.options.strict_vars = strict;
        self
    }

    /// Set the run-level `continue_on_failure` default.
    #[must_use]
    pub fn with_continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.default_continue_on_failure = continue_on_failure;
        self
    }

    /// Look up a suite by node id.
    #[must_use]
    pub fn suite(&self, node_id: &str) -> Option<Arc<Suite>> {
        self.suites.get(node_id).cloned()
    }
}
