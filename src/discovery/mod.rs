//! Suite discovery.
//!
//! Scans configured roots for `**/*.test.{yml,yaml}` files, skipping
//! `node_modules`, `drafts` and hidden paths, parses each into the suite
//! model and assigns stable node ids.

pub mod graph;

use std::collections::HashSet;
use std::path::Path;

use glob::Pattern;
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

use crate::suite::Suite;
use crate::{Error, Result};

/// Directory names never descended into.
const EXCLUDED_DIRS: &[&str] = &["node_modules", "drafts"];

fn suite_patterns() -> Vec<Pattern> {
    // `Pattern` has no brace expansion; one pattern per extension.
    vec![
        Pattern::new("*.test.yml").expect("static pattern"),
        Pattern::new("*.test.yaml").expect("static pattern"),
    ]
}

fn keep_entry(entry: &DirEntry) -> bool {
    // The walk root itself always passes, even when it is ".".
    if entry.depth() == 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    if name.starts_with('.') {
        return false;
    }
    if entry.file_type().is_dir() && EXCLUDED_DIRS.contains(&name.as_ref()) {
        return false;
    }
    true
}

/// Scan the given roots and load every suite file found.
///
/// Suites come back in discovery order with `node_id`,
/// `discovery_index` and `source_path` filled in.
///
/// # Errors
///
/// Unreadable files, invalid YAML, structural violations and duplicate
/// node ids abort discovery.
pub fn discover(roots: &[String]) -> Result<Vec<Suite>> {
    let patterns = suite_patterns();
    let mut suites = Vec::new();
    let mut seen_ids = HashSet::new();

    for root in roots {
        let root_path = Path::new(root);
        if !root_path.exists() {
            return Err(Error::Discovery(format!("Root does not exist: {root}")));
        }

        for entry in WalkDir::new(root_path)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(keep_entry)
        {
            let entry = entry.map_err(|e| Error::Discovery(format!("Walk failed: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !patterns.iter().any(|p| p.matches(&name)) {
                continue;
            }

            let mut suite = load_suite_file(entry.path())?;
            if suite.node_id.is_empty() {
                suite.node_id = node_id_from_path(root_path, entry.path());
            }
            if !seen_ids.insert(suite.node_id.clone()) {
                return Err(Error::Discovery(format!(
                    "Duplicate node_id '{}' (second occurrence: {})",
                    suite.node_id,
                    entry.path().display()
                )));
            }

            suite.discovery_index = suites.len();
            suite.source_path = Some(entry.path().to_path_buf());
            debug!(node_id = %suite.node_id, path = %entry.path().display(), "Discovered suite");
            suites.push(suite);
        }
    }

    info!(count = suites.len(), "Discovery complete");
    Ok(suites)
}

fn load_suite_file(path: &Path) -> Result<Suite> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Discovery(format!("Cannot read {}: {e}", path.display())))?;
    let suite: Suite = serde_yaml::from_str(&content)
        .map_err(|e| Error::Config(format!("Invalid suite file {}: {e}", path.display())))?;
    suite
        .validate()
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    Ok(suite)
}

/// Derive a stable node id from the file path relative to its root:
/// `flows/auth/login.test.yml` becomes `flows-auth-login`.
fn node_id_from_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let mut slug = relative.to_string_lossy().to_string();
    for suffix in [".test.yml", ".test.yaml"] {
        if let Some(stripped) = slug.strip_suffix(suffix) {
            slug = stripped.to_string();
            break;
        }
    }
    slug.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
