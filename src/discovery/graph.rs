//! Dependency graph over discovered suites.
//!
//! `depends_on` edges form a DAG; cycles and unknown references abort
//! before anything executes. The plan is layered: a suite sits in the
//! first layer where all of its dependencies are satisfied, and within a
//! layer suites order by priority, then discovery order.

use std::collections::{HashMap, HashSet};

use crate::suite::Suite;
use crate::{Error, Result};

/// Validated execution plan.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    /// All node ids in scheduling order (layer by layer).
    pub order: Vec<String>,
    /// Topological layers; every suite's dependencies live in earlier
    /// layers.
    pub layers: Vec<Vec<String>>,
    /// Direct dependencies per node.
    pub dependencies: HashMap<String, Vec<String>>,
    /// Direct dependents per node (reverse edges).
    pub dependents: HashMap<String, Vec<String>>,
}

impl ExecutionPlan {
    /// Every transitive dependent of a node, used to cascade skips.
    #[must_use]
    pub fn transitive_dependents(&self, node_id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![node_id.to_string()];
        let mut out = Vec::new();
        while let Some(current) = stack.pop() {
            for dependent in self.dependents.get(&current).into_iter().flatten() {
                if seen.insert(dependent.clone()) {
                    out.push(dependent.clone());
                    stack.push(dependent.clone());
                }
            }
        }
        out
    }
}

/// Build and validate the execution plan.
///
/// # Errors
///
/// `TargetNotFound` for a `depends_on` reference that matches no
/// discovered suite; `CircularDependency` when the graph has a cycle.
pub fn build_plan(suites: &[Suite]) -> Result<ExecutionPlan> {
    let by_id: HashMap<&str, &Suite> = suites.iter().map(|s| (s.node_id.as_str(), s)).collect();

    let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for suite in suites {
        for dep in &suite.depends_on {
            if !by_id.contains_key(dep.as_str()) {
                return Err(Error::TargetNotFound(format!(
                    "suite '{dep}' required by '{}' was not discovered",
                    suite.node_id
                )));
            }
            dependencies
                .entry(suite.node_id.clone())
                .or_default()
                .push(dep.clone());
            dependents
                .entry(dep.clone())
                .or_default()
                .push(suite.node_id.clone());
        }
        dependencies.entry(suite.node_id.clone()).or_default();
        dependents.entry(suite.node_id.clone()).or_default();
    }

    detect_cycles(suites, &dependencies)?;

    // Layered topological order: peel nodes whose dependencies are all
    // satisfied, priority-then-discovery within each layer.
    let mut remaining: HashSet<String> = suites.iter().map(|s| s.node_id.clone()).collect();
    let mut satisfied: HashSet<String> = HashSet::new();
    let mut layers: Vec<Vec<String>> = Vec::new();
    let mut order: Vec<String> = Vec::new();

    while !remaining.is_empty() {
        let mut ready: Vec<&Suite> = remaining
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).copied())
            .filter(|suite| {
                dependencies[&suite.node_id]
                    .iter()
                    .all(|dep| satisfied.contains(dep))
            })
            .collect();

        // Cycle detection above guarantees progress.
        debug_assert!(!ready.is_empty());
        if ready.is_empty() {
            return Err(Error::Internal(
                "dependency graph made no progress".to_string(),
            ));
        }

        ready.sort_by_key(|suite| (suite.priority.rank(), suite.discovery_index));
        let layer: Vec<String> = ready.iter().map(|s| s.node_id.clone()).collect();
        for id in &layer {
            remaining.remove(id);
            satisfied.insert(id.clone());
            order.push(id.clone());
        }
        layers.push(layer);
    }

    Ok(ExecutionPlan {
        order,
        layers,
        dependencies,
        dependents,
    })
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    White,
    Grey,
    Black,
}

/// DFS three-color cycle detection; reports the offending path.
fn detect_cycles(suites: &[Suite], dependencies: &HashMap<String, Vec<String>>) -> Result<()> {
    let mut marks: HashMap<&str, Mark> = suites
        .iter()
        .map(|s| (s.node_id.as_str(), Mark::White))
        .collect();

    fn visit<'a>(
        node: &'a str,
        dependencies: &'a HashMap<String, Vec<String>>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Result<()> {
        marks.insert(node, Mark::Grey);
        path.push(node);
        for dep in dependencies.get(node).into_iter().flatten() {
            match marks.get(dep.as_str()).copied().unwrap_or(Mark::White) {
                Mark::Grey => {
                    let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<&str> = path[start..].to_vec();
                    cycle.push(dep.as_str());
                    return Err(Error::CircularDependency(cycle.join(" -> ")));
                }
                Mark::White => visit(dep.as_str(), dependencies, marks, path)?,
                Mark::Black => {}
            }
        }
        path.pop();
        marks.insert(node, Mark::Black);
        Ok(())
    }

    for suite in suites {
        if marks[suite.node_id.as_str()] == Mark::White {
            let mut path = Vec::new();
            visit(suite.node_id.as_str(), dependencies, &mut marks, &mut path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::Priority;

    fn suite(node_id: &str, priority: Priority, deps: &[&str], index: usize) -> Suite {
        Suite {
            node_id: node_id.to_string(),
            suite_name: node_id.to_string(),
            base_url: None,
            priority,
            depends_on: deps.iter().map(ToString::to_string).collect(),
            variables: std::collections::BTreeMap::new(),
            exports: Vec::new(),
            tags: Vec::new(),
            continue_on_failure: None,
            steps: Vec::new(),
            source_path: None,
            discovery_index: index,
        }
    }

    #[test]
    fn dependencies_order_before_dependents() {
        let suites = vec![
            suite("b", Priority::Medium, &["a"], 0),
            suite("a", Priority::Medium, &[], 1),
        ];
        let plan = build_plan(&suites).unwrap();
        assert_eq!(plan.order, vec!["a", "b"]);
        assert_eq!(plan.layers.len(), 2);
    }

    #[test]
    fn priority_orders_within_a_layer() {
        let suites = vec![
            suite("low", Priority::Low, &[], 0),
            suite("crit", Priority::Critical, &[], 1),
            suite("med", Priority::Medium, &[], 2),
            suite("high", Priority::High, &[], 3),
        ];
        let plan = build_plan(&suites).unwrap();
        assert_eq!(plan.layers[0], vec!["crit", "high", "med", "low"]);
    }

    #[test]
    fn discovery_order_breaks_priority_ties() {
        let suites = vec![
            suite("second", Priority::Medium, &[], 0),
            suite("first", Priority::Medium, &[], 1),
        ];
        let plan = build_plan(&suites).unwrap();
        // Same priority: the earlier-discovered suite runs first.
        assert_eq!(plan.layers[0], vec!["second", "first"]);
    }

    #[test]
    fn unknown_dependency_is_target_not_found() {
        let suites = vec![suite("b", Priority::Medium, &["ghost"], 0)];
        assert!(matches!(
            build_plan(&suites),
            Err(Error::TargetNotFound(msg)) if msg.contains("ghost")
        ));
    }

    #[test]
    fn cycles_are_detected_with_their_path() {
        let suites = vec![
            suite("a", Priority::Medium, &["b"], 0),
            suite("b", Priority::Medium, &["c"], 1),
            suite("c", Priority::Medium, &["a"], 2),
        ];
        match build_plan(&suites) {
            Err(Error::CircularDependency(path)) => {
                assert!(path.contains("a") && path.contains("b") && path.contains("c"));
            }
            other => panic!("expected CircularDependency, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let suites = vec![suite("a", Priority::Medium, &["a"], 0)];
        assert!(matches!(
            build_plan(&suites),
            Err(Error::CircularDependency(_))
        ));
    }

    #[test]
    fn transitive_dependents_cascade() {
        let suites = vec![
            suite("a", Priority::Medium, &[], 0),
            suite("b", Priority::Medium, &["a"], 1),
            suite("c", Priority::Medium, &["b"], 2),
            suite("d", Priority::Medium, &[], 3),
        ];
        let plan = build_plan(&suites).unwrap();
        let mut downstream = plan.transitive_dependents("a");
        downstream.sort();
        assert_eq!(downstream, vec!["b", "c"]);
    }
}
