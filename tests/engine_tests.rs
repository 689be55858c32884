//! End-to-end engine scenarios against an in-process stub server.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use pretty_assertions::assert_eq;
use serde_json::json;

use flow_test_engine::bus::{EventFilter, LogBus, LogLevel};
use flow_test_engine::config::{Config, ReportingConfig, Workers};
use flow_test_engine::executor::step::StepRunner;
use flow_test_engine::executor::RunContext;
use flow_test_engine::orchestrator::Orchestrator;
use flow_test_engine::report::{StepStatus, SuiteStatus};
use flow_test_engine::scope::VariableScope;
use flow_test_engine::suite::{CallSpec, Step, Suite};

/// Spawn the stub API on an ephemeral port, returning its base URL.
async fn spawn_stub() -> String {
    let hits = Arc::new(AtomicU32::new(0));

    async fn user(AxumPath(id): AxumPath<u64>) -> Json<serde_json::Value> {
        Json(json!({ "id": id, "name": "Ada Lovelace", "roles": ["admin"] }))
    }

    async fn echo_headers(headers: HeaderMap) -> Json<serde_json::Value> {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        Json(json!({ "authorization": auth }))
    }

    async fn flaky(State(hits): State<Arc<AtomicU32>>) -> impl IntoResponse {
        let n = hits.fetch_add(1, Ordering::SeqCst);
        if n < 2 {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false })),
            )
        } else {
            (axum::http::StatusCode::OK, Json(json!({ "ok": true })))
        }
    }

    async fn slow() -> Json<serde_json::Value> {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        Json(json!({ "ok": true }))
    }

    let app = Router::new()
        .route("/users/{id}", get(user))
        .route("/echo-headers", get(echo_headers))
        .route("/flaky", get(flaky))
        .route("/slow", get(slow))
        .with_state(hits);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve stub");
    });
    format!("http://{addr}")
}

fn write_suite(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn config_for(dir: &Path) -> Config {
    Config {
        roots: vec![dir.to_string_lossy().to_string()],
        reporting: ReportingConfig {
            enabled: false,
            ..ReportingConfig::default()
        },
        ..Config::default()
    }
}

/// A TCP port that nothing listens on.
async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn simple_get_with_assertion_and_capture() {
    let base = spawn_stub().await;
    let dir = tempfile::tempdir().unwrap();
    write_suite(
        dir.path(),
        "simple.test.yml",
        &format!(
            r"
node_id: simple
suite_name: Simple GET
variables:
  base_url: '{base}'
steps:
  - name: fetch-user
    request:
      method: GET
      url: '{{{{base_url}}}}/users/1'
    assert:
      status_code: {{ equals: 200 }}
      body:
        id: {{ equals: 1 }}
    capture:
      user_name: '@body.name'
"
        ),
    );

    let orchestrator = Orchestrator::new(config_for(dir.path()), Arc::new(LogBus::new()));
    let result = orchestrator.run().await.unwrap();

    assert_eq!(result.total_tests, 1);
    assert!((result.success_rate - 100.0).abs() < f64::EPSILON, "{result:?}");
    let step = &result.suites_results[0].steps_results[0];
    assert_eq!(step.status, StepStatus::Success);
    assert_eq!(step.captured_variables["user_name"], json!("Ada Lovelace"));
    assert!(step.assertions_results.iter().all(|a| a.passed));
}

#[tokio::test]
async fn dependency_ordering_exposes_exports_to_downstream_requests() {
    let base = spawn_stub().await;
    let dir = tempfile::tempdir().unwrap();
    write_suite(
        dir.path(),
        "a.test.yml",
        r"
node_id: a
suite_name: Producer
exports: [token]
steps:
  - name: make-token
    capture:
      token: 'tok-123'
",
    );
    write_suite(
        dir.path(),
        "b.test.yml",
        &format!(
            r"
node_id: b
suite_name: Consumer
depends_on: [a]
base_url: '{base}'
steps:
  - name: send-token
    request:
      method: GET
      url: /echo-headers
      headers:
        Authorization: 'Bearer {{{{a.token}}}}'
    assert:
      status_code: {{ equals: 200 }}
      body:
        authorization: {{ equals: 'Bearer tok-123' }}
"
        ),
    );

    let orchestrator = Orchestrator::new(config_for(dir.path()), Arc::new(LogBus::new()));
    let result = orchestrator.run().await.unwrap();

    assert_eq!(result.failed_tests, 0, "{result:?}");
    // B ran strictly after A: its result sits later in dependency order.
    assert_eq!(result.suites_results[0].node_id, "a");
    assert_eq!(result.suites_results[1].node_id, "b");
    assert_eq!(result.suites_results[1].status, SuiteStatus::Success);
}

#[tokio::test]
async fn retry_budget_is_consumed_on_connection_refused() {
    let port = closed_port().await;
    let dir = tempfile::tempdir().unwrap();
    write_suite(
        dir.path(),
        "refused.test.yml",
        &format!(
            r"
node_id: refused
suite_name: Refused
steps:
  - name: unreachable
    request:
      method: GET
      url: 'http://127.0.0.1:{port}/nope'
      timeout_ms: 2000
    retry:
      max_attempts: 3
      delay_ms: 10
      multiplier: 2
"
        ),
    );

    let started = std::time::Instant::now();
    let orchestrator = Orchestrator::new(config_for(dir.path()), Arc::new(LogBus::new()));
    let result = orchestrator.run().await.unwrap();

    let step = &result.suites_results[0].steps_results[0];
    assert_eq!(step.status, StepStatus::Failure);
    assert_eq!(step.attempts, 3);
    // Two backoffs: 10ms then 20ms.
    assert!(started.elapsed() >= std::time::Duration::from_millis(30));
    assert!(step.error.as_deref().unwrap().to_lowercase().contains("refused"));
}

#[tokio::test]
async fn retry_on_assertion_failure_recovers_a_flaky_endpoint() {
    let base = spawn_stub().await;
    let dir = tempfile::tempdir().unwrap();
    write_suite(
        dir.path(),
        "flaky.test.yml",
        &format!(
            r"
node_id: flaky
suite_name: Flaky
base_url: '{base}'
steps:
  - name: eventually-ok
    request:
      method: GET
      url: /flaky
    assert:
      status_code: {{ equals: 200 }}
      body:
        ok: {{ equals: true }}
    retry:
      max_attempts: 3
      delay_ms: 10
      multiplier: 2
      on_assertion_failure: true
"
        ),
    );

    let orchestrator = Orchestrator::new(config_for(dir.path()), Arc::new(LogBus::new()));
    let result = orchestrator.run().await.unwrap();

    let step = &result.suites_results[0].steps_results[0];
    assert_eq!(step.status, StepStatus::Success, "{:?}", step.error);
    assert_eq!(step.attempts, 3);
}

#[tokio::test]
async fn sandbox_denial_fails_the_capture_and_the_step() {
    let dir = tempfile::tempdir().unwrap();
    write_suite(
        dir.path(),
        "denied.test.yml",
        r#"
node_id: denied
suite_name: Denied
steps:
  - name: steal
    capture:
      token: "$require('fs')"
"#,
    );

    let orchestrator = Orchestrator::new(config_for(dir.path()), Arc::new(LogBus::new()));
    let result = orchestrator.run().await.unwrap();

    assert_eq!(result.failed_tests, 1);
    let step = &result.suites_results[0].steps_results[0];
    assert_eq!(step.status, StepStatus::Failure);
    let error = step.error.as_deref().unwrap();
    assert!(error.contains("token"), "{error}");
    assert!(error.contains("JavaScript validation failed"), "{error}");
}

#[tokio::test]
async fn call_depth_limit_raises_with_the_chain_recorded() {
    // c1 -> c2 -> ... -> c12; c12 executes at depth 11, one past the cap.
    let steps: Vec<Step> = (1..=12)
        .map(|i| {
            if i < 12 {
                Step {
                    name: format!("c{i}"),
                    call: Some(CallSpec {
                        target: format!("c{}", i + 1),
                        with: BTreeMap::new(),
                        propagate: None,
                    }),
                    ..Step::default()
                }
            } else {
                Step {
                    name: "c12".to_string(),
                    capture: Some(BTreeMap::from([(
                        "done".to_string(),
                        "true".to_string(),
                    )])),
                    ..Step::default()
                }
            }
        })
        .collect();
    let suite = Suite {
        node_id: "chain".to_string(),
        suite_name: "Chain".to_string(),
        base_url: None,
        priority: flow_test_engine::suite::Priority::Medium,
        depends_on: Vec::new(),
        variables: BTreeMap::new(),
        exports: Vec::new(),
        tags: Vec::new(),
        continue_on_failure: None,
        steps: steps.clone(),
        source_path: None,
        discovery_index: 0,
    };

    let ctx = RunContext::new(
        "run-depth",
        Arc::new(LogBus::new()),
        vec![suite.clone()],
        std::collections::HashMap::new(),
    );
    let mut scope = VariableScope::new(Arc::clone(&ctx.env), Arc::clone(&ctx.globals));

    let result = StepRunner::new(&ctx, &suite)
        .run(&steps[0], &mut scope, 0, &[])
        .await;

    assert_eq!(result.status, StepStatus::Failure);
    let error = result.error.unwrap();
    assert!(error.contains("call depth"), "{error}");
    // The failing chain names the deep targets.
    assert!(error.contains("c11"), "{error}");
    assert_eq!(result.call_stack, Some(vec!["c2".to_string()]));
}

#[tokio::test]
async fn ten_levels_of_calls_are_within_the_limit() {
    let steps: Vec<Step> = (1..=10)
        .map(|i| {
            if i < 10 {
                Step {
                    name: format!("c{i}"),
                    call: Some(CallSpec {
                        target: format!("c{}", i + 1),
                        with: BTreeMap::new(),
                        propagate: None,
                    }),
                    ..Step::default()
                }
            } else {
                Step {
                    name: "c10".to_string(),
                    capture: Some(BTreeMap::from([(
                        "done".to_string(),
                        "'yes'".to_string(),
                    )])),
                    ..Step::default()
                }
            }
        })
        .collect();
    let suite = Suite {
        node_id: "ok-chain".to_string(),
        suite_name: "OkChain".to_string(),
        base_url: None,
        priority: flow_test_engine::suite::Priority::Medium,
        depends_on: Vec::new(),
        variables: BTreeMap::new(),
        exports: Vec::new(),
        tags: Vec::new(),
        continue_on_failure: None,
        steps: steps.clone(),
        source_path: None,
        discovery_index: 0,
    };

    let ctx = RunContext::new(
        "run-depth-ok",
        Arc::new(LogBus::new()),
        vec![suite.clone()],
        std::collections::HashMap::new(),
    );
    let mut scope = VariableScope::new(Arc::clone(&ctx.env), Arc::clone(&ctx.globals));

    let result = StepRunner::new(&ctx, &suite)
        .run(&steps[0], &mut scope, 0, &[])
        .await;
    assert_eq!(result.status, StepStatus::Success, "{:?}", result.error);
}

#[tokio::test]
async fn log_fanout_filters_and_orders_events() {
    let base = spawn_stub().await;
    let dir = tempfile::tempdir().unwrap();
    write_suite(
        dir.path(),
        "good.test.yml",
        &format!(
            r"
node_id: good
suite_name: Good
base_url: '{base}'
steps:
  - name: ok
    request: {{ method: GET, url: /users/7 }}
    assert:
      status_code: {{ equals: 200 }}
"
        ),
    );
    write_suite(
        dir.path(),
        "bad.test.yml",
        &format!(
            r"
node_id: bad
suite_name: Bad
base_url: '{base}'
steps:
  - name: wrong
    request: {{ method: GET, url: /users/7 }}
    assert:
      status_code: {{ equals: 418 }}
"
        ),
    );

    let bus = Arc::new(LogBus::new());
    let mut all_events = bus.subscribe(EventFilter::default());
    let mut error_events = bus.subscribe(EventFilter {
        run_id: None,
        levels: Some(vec![LogLevel::Error]),
    });

    let mut config = config_for(dir.path());
    config.workers = Workers(4);
    let orchestrator = Orchestrator::new(config, Arc::clone(&bus));
    let result = orchestrator.run().await.unwrap();
    assert_eq!(result.failed_tests, 1);

    let mut all: Vec<_> = Vec::new();
    while let Some(event) = all_events.try_recv() {
        all.push(event);
    }
    let mut errors: Vec<_> = Vec::new();
    while let Some(event) = error_events.try_recv() {
        errors.push(event);
    }

    assert!(!all.is_empty());
    assert!(errors.iter().all(|e| e.level == LogLevel::Error));
    // Every error event is also seen, in the same order, by the
    // unfiltered subscriber.
    let all_error_ids: Vec<&str> = all
        .iter()
        .filter(|e| e.level == LogLevel::Error)
        .map(|e| e.id.as_str())
        .collect();
    let filtered_ids: Vec<&str> = errors.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(all_error_ids, filtered_ids);
    // The failing suite produced the error events.
    assert!(errors.iter().any(|e| {
        e.context
            .as_ref()
            .and_then(|c| c.node_id.as_deref())
            == Some("bad")
    }));
    // Per-suite FIFO: within one suite, event ids arrive in
    // publication order (cross-suite interleaving is unordered).
    for node in ["good", "bad"] {
        let ids: Vec<u64> = all
            .iter()
            .filter(|e| {
                e.context.as_ref().and_then(|c| c.node_id.as_deref()) == Some(node)
            })
            .map(|e| e.id.trim_start_matches("evt-").parse().unwrap())
            .collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }
}

#[tokio::test]
async fn request_timeout_fails_deterministically() {
    let base = spawn_stub().await;
    let dir = tempfile::tempdir().unwrap();
    write_suite(
        dir.path(),
        "slow.test.yml",
        &format!(
            r"
node_id: slow
suite_name: Slow
base_url: '{base}'
steps:
  - name: too-slow
    request:
      method: GET
      url: /slow
      timeout_ms: 50
"
        ),
    );

    let orchestrator = Orchestrator::new(config_for(dir.path()), Arc::new(LogBus::new()));
    let result = orchestrator.run().await.unwrap();

    let step = &result.suites_results[0].steps_results[0];
    assert_eq!(step.status, StepStatus::Failure);
    assert_eq!(
        step.error.as_deref(),
        Some("Request timed out after 50ms")
    );
}

#[tokio::test]
async fn scenarios_first_match_attaches_checks() {
    let base = spawn_stub().await;
    let dir = tempfile::tempdir().unwrap();
    write_suite(
        dir.path(),
        "scenario.test.yml",
        &format!(
            r"
node_id: scenario
suite_name: Scenario
base_url: '{base}'
steps:
  - name: branch
    request: {{ method: GET, url: /users/5 }}
    scenarios:
      - name: not-found
        condition: 'response.status == 404'
        assert:
          status_code: {{ equals: 404 }}
      - name: found
        condition: 'response.status == 200'
        assert:
          body:
            name: {{ contains: Ada }}
        capture:
          found_name: '@body.name'
      - name: shadowed
        condition: 'true'
        capture:
          never: '@body.id'
"
        ),
    );

    let orchestrator = Orchestrator::new(config_for(dir.path()), Arc::new(LogBus::new()));
    let result = orchestrator.run().await.unwrap();

    let step = &result.suites_results[0].steps_results[0];
    assert_eq!(step.status, StepStatus::Success, "{:?}", step.error);
    assert_eq!(step.captured_variables["found_name"], json!("Ada Lovelace"));
    assert!(!step.captured_variables.contains_key("never"));

    let metas = step.scenarios_meta.as_ref().unwrap();
    assert_eq!(metas.len(), 3);
    assert!(!metas[0].matched && !metas[0].executed);
    assert!(metas[1].matched && metas[1].executed);
    assert!(!metas[2].matched && !metas[2].executed);
}

#[tokio::test]
async fn run_totals_satisfy_the_accounting_invariant() {
    let base = spawn_stub().await;
    let dir = tempfile::tempdir().unwrap();
    write_suite(
        dir.path(),
        "mixed.test.yml",
        &format!(
            r"
node_id: mixed
suite_name: Mixed
base_url: '{base}'
steps:
  - name: passes
    request: {{ method: GET, url: /users/1 }}
    assert:
      status_code: {{ equals: 200 }}
  - name: fails
    request: {{ method: GET, url: /users/1 }}
    assert:
      status_code: {{ equals: 500 }}
  - name: skipped-after-failure
    request: {{ method: GET, url: /users/1 }}
"
        ),
    );

    let orchestrator = Orchestrator::new(config_for(dir.path()), Arc::new(LogBus::new()));
    let result = orchestrator.run().await.unwrap();

    assert_eq!(result.total_tests, 3);
    assert_eq!(result.successful_tests, 1);
    assert_eq!(result.failed_tests, 1);
    assert_eq!(result.skipped_tests, 1);
    assert_eq!(
        result.successful_tests + result.failed_tests + result.skipped_tests,
        result.total_tests
    );
    let executed: usize = result.suites_results.iter().map(|s| s.steps_executed).sum();
    assert_eq!(result.total_tests, executed);
}
