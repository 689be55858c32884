//! Flow Test Engine
//!
//! A declarative API test engine: YAML suites describe HTTP steps,
//! assertions, captures and lifecycle hooks; the engine discovers
//! suites, orders them by dependency, executes them on a bounded worker
//! pool and streams structured telemetry while it runs.
//!
//! # Subsystems
//!
//! - **Scope & expressions**: layered variable resolution, `{{...}}`
//!   interpolation, JMESPath queries, a restricted JS sandbox and faker
//!   generation
//! - **Execution**: per-step lifecycle state machine, suite walk,
//!   cross-suite calls with depth/cycle guards
//! - **Scheduling**: suite discovery, dependency DAG, priority-ordered
//!   parallel dispatch
//! - **Observability**: process-wide log bus with sessions, bounded
//!   backlog and an SSE endpoint

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod assertion;
pub mod bus;
pub mod capture;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod expression;
pub mod faker;
pub mod hooks;
pub mod http;
pub mod interpolation;
pub mod orchestrator;
pub mod report;
pub mod sandbox;
pub mod scope;
pub mod stream;
pub mod suite;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
