//! Configuration management.
//!
//! Layered via figment: YAML/JSON config file, then `FLOW_TEST_*`
//! environment variables (`__` separates nesting). Env files listed in
//! `env_files` are loaded into the process environment before the run
//! snapshot is taken.

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::suite::Priority;
use crate::{Error, Result};

/// Default config file names probed in the working directory.
const DEFAULT_CONFIG_FILES: &[&str] = &[
    "flow-test.config.yml",
    "flow-test.config.yaml",
    "flow-test.config.json",
];

/// Hard cap on the worker pool.
pub const MAX_WORKERS: usize = 16;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Project label surfaced in reports.
    pub project_name: ProjectName,

    /// Env files loaded before the run snapshot (later files override).
    pub env_files: Vec<String>,

    /// Directories scanned for suite files.
    pub roots: Vec<String>,

    /// Worker pool size (clamped to 1..=16).
    pub workers: Workers,

    /// Run-level default for `continue_on_failure`.
    pub continue_on_failure: bool,

    /// Treat unresolved template variables as errors.
    pub strict_vars: bool,

    /// Report output configuration.
    pub reporting: ReportingConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutsConfig,

    /// Suite selection filters.
    pub filters: FiltersConfig,

    /// SSE telemetry endpoint configuration.
    pub streaming: StreamingConfig,
}

/// Newtype so an absent `project_name` defaults sensibly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectName(pub String);

impl Default for ProjectName {
    fn default() -> Self {
        Self("flow-test".to_string())
    }
}

/// Newtype carrying the worker-count default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workers(pub usize);

impl Default for Workers {
    fn default() -> Self {
        Self(4)
    }
}

/// Report output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    /// Write JSON reports.
    pub enabled: bool,
    /// Directory reports are written into.
    pub output_dir: String,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: "results".to_string(),
        }
    }
}

/// Timeout configuration. Values accept humantime forms (`90s`, `5m`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Default per-request timeout.
    #[serde(with = "humantime_serde")]
    pub request: Duration,
    /// Optional per-suite budget.
    #[serde(with = "humantime_serde")]
    pub suite: Option<Duration>,
    /// Optional whole-run budget.
    #[serde(with = "humantime_serde")]
    pub run: Option<Duration>,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(60),
            suite: None,
            run: None,
        }
    }
}

/// Suite selection filters; empty lists select everything.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FiltersConfig {
    /// Keep suites carrying at least one of these tags.
    pub tags: Vec<String>,
    /// Keep suites of these priorities.
    pub priorities: Vec<Priority>,
    /// Keep exactly these node ids.
    pub node_ids: Vec<String>,
}

impl FiltersConfig {
    /// Whether any filter is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.priorities.is_empty() && self.node_ids.is_empty()
    }
}

/// SSE telemetry endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Serve the endpoint during runs.
    pub enabled: bool,
    /// Bind address.
    pub addr: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: "127.0.0.1:4097".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, or probe the default
    /// file names, then layer `FLOW_TEST_*` env overrides on top.
    ///
    /// # Errors
    ///
    /// Missing explicit file, unparseable file, or schema violations.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            figment = Self::with_file(figment, path);
        } else {
            for candidate in DEFAULT_CONFIG_FILES {
                let candidate = Path::new(candidate);
                if candidate.exists() {
                    debug!(path = %candidate.display(), "Using config file");
                    figment = Self::with_file(figment, candidate);
                    break;
                }
            }
        }

        let config: Self = figment
            .merge(Env::prefixed("FLOW_TEST_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files()?;
        Ok(config)
    }

    fn with_file(figment: Figment, path: &Path) -> Figment {
        if path.extension().is_some_and(|ext| ext == "json") {
            figment.merge(Json::file(path))
        } else {
            figment.merge(Yaml::file(path))
        }
    }

    /// Load declared env files into the process environment. Missing
    /// files are a configuration error; later files override earlier.
    fn load_env_files(&self) -> Result<()> {
        for file in &self.env_files {
            dotenvy::from_path_override(Path::new(file))
                .map_err(|e| Error::Config(format!("Cannot load env file {file}: {e}")))?;
            debug!(path = %file, "Loaded env file");
        }
        Ok(())
    }

    /// Effective roots (defaults to the working directory).
    #[must_use]
    pub fn roots(&self) -> Vec<String> {
        if self.roots.is_empty() {
            vec![".".to_string()]
        } else {
            self.roots.clone()
        }
    }

    /// Worker count clamped into `1..=MAX_WORKERS`.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.0.clamp(1, MAX_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_match_the_documented_contract() {
        let config = Config::default();
        assert_eq!(config.project_name.0, "flow-test");
        assert_eq!(config.worker_count(), 4);
        assert_eq!(config.reporting.output_dir, "results");
        assert!(config.reporting.enabled);
        assert_eq!(config.timeouts.request, Duration::from_secs(60));
        assert!(config.timeouts.run.is_none());
        assert!(!config.streaming.enabled);
        assert!(config.filters.is_empty());
    }

    #[test]
    fn workers_clamp_to_the_cap() {
        let config = Config {
            workers: Workers(99),
            ..Config::default()
        };
        assert_eq!(config.worker_count(), MAX_WORKERS);

        let config = Config {
            workers: Workers(0),
            ..Config::default()
        };
        assert_eq!(config.worker_count(), 1);
    }

    #[test]
    fn yaml_config_files_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow-test.config.yml");
        fs::write(
            &path,
            "project_name: demo\nworkers: 8\nroots: [flows]\ntimeouts:\n  request: 30s\n  run: 5m\nfilters:\n  priorities: [critical, high]\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.project_name.0, "demo");
        assert_eq!(config.worker_count(), 8);
        assert_eq!(config.roots(), vec!["flows".to_string()]);
        assert_eq!(config.timeouts.request, Duration::from_secs(30));
        assert_eq!(config.timeouts.run, Some(Duration::from_secs(300)));
        assert_eq!(config.filters.priorities.len(), 2);
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        assert!(matches!(
            Config::load(Some(Path::new("/nope/flow-test.config.yml"))),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn empty_roots_default_to_cwd() {
        assert_eq!(Config::default().roots(), vec![".".to_string()]);
    }
}
