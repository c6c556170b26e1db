//! End-to-end integration tests for the scenario harness
//!
//! These tests drive the real runner against:
//! 1. `/bin/sh`, for precise control over output timing and exit codes
//! 2. the `mock-host` binary, a stand-in for a CLI that starts a local host
//!
//! and check that no spawned process survives its scenario.

#![cfg(unix)]

use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use harness::common::config::{HttpReadiness, Timeouts};
use harness::http::HttpProbe;
use harness::port::PortReservation;
use harness::readiness::RetryPolicy;
use harness::scenario::{
    load_scenario, parse_scenario, verify_fn, Action, Actions, RunnerOptions, ScenarioReport, StepPhase,
};
use harness::{Error, Scenario, ScenarioRunner, Step};

/// Test context: a private workspace root and runner options
struct TestContext {
    /// Temporary directory holding this test's workspaces
    root: tempfile::TempDir,
    options: RunnerOptions,
}

impl TestContext {
    fn new(program: impl Into<PathBuf>) -> Self {
        let root = tempfile::tempdir().expect("Failed to create temp dir");
        let mut options = RunnerOptions::new(program);
        options.workspace_root = root.path().to_path_buf();
        options.timeouts = Timeouts {
            step_secs: 20,
            output_secs: 10,
            kill_grace_ms: 2000,
        };
        options.readiness.http = HttpReadiness {
            attempts: 40,
            interval_ms: 250,
            request_timeout_secs: 2,
            health_path: "/admin/host/ping".to_string(),
        };
        Self { root, options }
    }

    fn shell() -> Self {
        Self::new("/bin/sh")
    }

    fn mock_host() -> Self {
        Self::new(env!("CARGO_BIN_EXE_mock-host"))
    }

    async fn run(&self, scenario: &Scenario) -> ScenarioReport {
        ScenarioRunner::new(self.options.clone()).run(scenario).await
    }

    /// Number of workspaces still on disk
    fn workspaces_left(&self) -> usize {
        fs::read_dir(self.root.path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

fn sh(script: &str) -> Step {
    Step::new([format!("-c '{}'", script)]).expect("Invalid command line")
}

fn assert_passed(report: &ScenarioReport) {
    assert!(
        report.passed,
        "Scenario '{}' failed: {}",
        report.name,
        report
            .failure
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_default()
    );
}

/// Alive and not a zombie
fn is_alive(pid: u32) -> bool {
    if let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) {
        let state = stat.rsplit(')').next().and_then(|s| s.split_whitespace().next());
        if state == Some("Z") {
            return false;
        }
    }
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

async fn wait_until_gone(pid: u32) -> bool {
    for _ in 0..50 {
        if !is_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// A port nothing listens on
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
    listener.local_addr().unwrap().port()
}

// ============== Shell scenarios ==============

#[tokio::test]
async fn test_banner_detected_without_waiting_for_exit() {
    let ctx = TestContext::shell();
    let scenario = Scenario::new(
        "banner",
        vec![sh("sleep 0.5; echo Ready; sleep 60").keep_running().output_contains(["Ready"])],
    );

    let started = Instant::now();
    let report = ctx.run(&scenario).await;

    assert_passed(&report);
    assert!(started.elapsed() < Duration::from_secs(10), "took {:?}", started.elapsed());
}

#[tokio::test]
async fn test_expected_error_exit_with_stderr_text() {
    let ctx = TestContext::shell();
    let scenario = Scenario::new(
        "bad_config",
        vec![sh("echo \"bad config\" >&2; exit 1").expect_error_exit(["bad config"])],
    );

    let report = ctx.run(&scenario).await;
    assert_passed(&report);
}

#[tokio::test]
async fn test_exit_in_error_with_status_zero_fails() {
    let ctx = TestContext::shell();
    let scenario = Scenario::new(
        "zero_exit",
        vec![sh("echo \"bad config\" >&2; exit 0").expect_error_exit(["bad config"])],
    );

    let report = ctx.run(&scenario).await;

    assert!(!report.passed);
    let failure = report.failure.expect("Expected a failure");
    assert_eq!(failure.step, 1);
    assert_eq!(failure.phase, StepPhase::NaturallyExited);
    assert!(
        matches!(failure.error, Error::UnexpectedExitCode { code: Some(0), .. }),
        "unexpected error: {}",
        failure.error
    );
}

#[tokio::test]
async fn test_missing_error_text_fails() {
    let ctx = TestContext::shell();
    let scenario = Scenario::new(
        "wrong_message",
        vec![sh("echo \"other problem\" >&2; exit 1").expect_error_exit(["bad config"])],
    );

    let report = ctx.run(&scenario).await;

    let failure = report.failure.expect("Expected a failure");
    match failure.error {
        Error::MissingErrorText { text, output } => {
            assert_eq!(text, "bad config");
            assert!(output.stderr.contains("other problem"));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_still_running_when_exit_expected() {
    let mut ctx = TestContext::shell();
    ctx.options.timeouts.step_secs = 1;
    let scenario = Scenario::new("hangs", vec![sh("echo waiting; sleep 60")]);

    let report = ctx.run(&scenario).await;

    let failure = report.failure.expect("Expected a failure");
    match failure.error {
        Error::UnexpectedlyStillRunning { output, .. } => assert!(output.stdout.contains("waiting")),
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_step_budget_covers_every_command() {
    let mut ctx = TestContext::shell();
    ctx.options.timeouts.step_secs = 1;
    // Each command fits the budget alone, together they do not
    let scenario = Scenario::new(
        "slow_setup",
        vec![Step::new(["-c 'sleep 0.7'", "-c 'sleep 0.7'"]).unwrap()],
    );

    let report = ctx.run(&scenario).await;

    let failure = report.failure.expect("Expected a failure");
    assert!(
        matches!(failure.error, Error::UnexpectedlyStillRunning { .. }),
        "{}",
        failure.error
    );
    assert!(report.duration < Duration::from_secs(3), "took {:?}", report.duration);
}

#[tokio::test]
async fn test_output_split_across_chunks_is_matched() {
    let ctx = TestContext::shell();
    let scenario = Scenario::new(
        "split",
        vec![sh("printf Rea; sleep 0.5; printf dy; sleep 60")
            .keep_running()
            .output_contains(["Ready"])],
    );

    let report = ctx.run(&scenario).await;
    assert_passed(&report);
}

#[tokio::test]
async fn test_forbidden_output_fails_running_step() {
    let ctx = TestContext::shell();
    let scenario = Scenario::new(
        "forbidden",
        vec![sh("echo started; echo Skipping setting; sleep 60")
            .keep_running()
            .output_contains(["started"])
            .output_doesnt_contain(["Skipping"])
            .verify(verify_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(())
            }))],
    );

    let report = ctx.run(&scenario).await;

    let failure = report.failure.expect("Expected a failure");
    assert!(matches!(failure.error, Error::ForbiddenOutputText { .. }), "{}", failure.error);
}

#[tokio::test]
async fn test_file_from_previous_step_is_visible() {
    let ctx = TestContext::shell();
    let scenario = Scenario::new(
        "shared_workspace",
        vec![
            sh("printf hello > data.txt"),
            sh("true").verify(Arc::new(Actions(vec![Action::WriteFile {
                path: "note.txt".into(),
                content: "from verify".to_string(),
            }]))),
            sh("cat data.txt; cat note.txt").output_contains(["hello", "from verify"]),
        ],
    );

    let report = ctx.run(&scenario).await;

    assert_passed(&report);
    assert_eq!(report.steps_run, 3);
    assert_eq!(ctx.workspaces_left(), 0);
}

#[tokio::test]
async fn test_setup_command_must_succeed() {
    let ctx = TestContext::shell();
    let scenario = Scenario::new(
        "setup_fails",
        vec![Step::new(["-c 'exit 2'", "-c 'echo never'"]).unwrap()],
    );

    let report = ctx.run(&scenario).await;

    let failure = report.failure.expect("Expected a failure");
    assert_eq!(failure.phase, StepPhase::NotStarted);
    assert_eq!(failure.command.as_deref(), Some("-c 'exit 2'"));
    assert!(matches!(failure.error, Error::UnexpectedExitCode { code: Some(2), .. }));
}

#[tokio::test]
async fn test_fail_fast_kills_running_process_and_cleans_up() {
    let ctx = TestContext::shell();
    let pid = Arc::new(Mutex::new(None));
    let seen = pid.clone();

    let scenario = Scenario::new(
        "fail_fast",
        vec![
            sh("echo up; sleep 60")
                .keep_running()
                .output_contains(["up"])
                .verify(verify_fn(move |ctx| {
                    let seen = seen.clone();
                    async move {
                        *seen.lock().unwrap() = ctx.process()?.pid();
                        Ok(())
                    }
                })),
            sh("exit 3"),
            sh("echo unreachable > marker.txt"),
        ],
    );

    let report = ctx.run(&scenario).await;

    assert!(!report.passed);
    assert_eq!(report.steps_run, 2);
    assert_eq!(report.steps_total, 3);
    assert_eq!(report.failure.as_ref().map(|f| f.step), Some(2));
    assert!(report.kept_workspace.is_none());
    assert_eq!(ctx.workspaces_left(), 0);

    let pid = pid.lock().unwrap().expect("Step 1 verify did not run");
    assert!(wait_until_gone(pid).await, "process {} survived the scenario", pid);
}

#[tokio::test]
async fn test_teardown_kills_running_process_before_next_step() {
    let ctx = TestContext::shell();
    let pid = Arc::new(Mutex::new(None));
    let recorded = pid.clone();
    let checked = pid.clone();

    let scenario = Scenario::new(
        "teardown",
        vec![
            sh("echo up; sleep 60")
                .keep_running()
                .output_contains(["up"])
                .verify(verify_fn(move |ctx| {
                    let recorded = recorded.clone();
                    async move {
                        *recorded.lock().unwrap() = ctx.process()?.pid();
                        Ok(())
                    }
                })),
            sh("true").verify(verify_fn(move |_| {
                let checked = checked.clone();
                async move {
                    let pid = checked
                        .lock()
                        .unwrap()
                        .ok_or_else(|| Error::Assertion("step 1 pid missing".to_string()))?;
                    if is_alive(pid) {
                        return Err(Error::Assertion(format!("process {} still running", pid)));
                    }
                    Ok(())
                }
            })),
        ],
    )
    .teardown_between_steps(true);

    let report = ctx.run(&scenario).await;
    assert_passed(&report);
    assert_eq!(report.steps_run, 2);
    assert!(pid.lock().unwrap().is_some());
}

#[tokio::test]
async fn test_await_output_action() {
    let ctx = TestContext::shell();
    let scenario = Scenario::new(
        "await_output",
        vec![sh("echo start; sleep 0.3; echo later; sleep 0.3; echo latest; sleep 60")
            .keep_running()
            .output_contains(["start"])
            .verify(Arc::new(Actions(vec![
                Action::AwaitOutput {
                    text: "later".to_string(),
                    timeout_secs: None,
                },
                Action::AwaitOutput {
                    text: "latest".to_string(),
                    timeout_secs: Some(5),
                },
                Action::Kill,
            ])))],
    );

    let report = ctx.run(&scenario).await;
    assert_passed(&report);
}

#[tokio::test]
async fn test_await_output_action_times_out() {
    let ctx = TestContext::shell();
    let scenario = Scenario::new(
        "await_output_timeout",
        vec![sh("echo start; sleep 60")
            .keep_running()
            .output_contains(["start"])
            .verify(Arc::new(Actions(vec![Action::AwaitOutput {
                text: "never printed".to_string(),
                timeout_secs: Some(1),
            }])))],
    );

    let report = ctx.run(&scenario).await;

    let failure = report.failure.expect("Expected a failure");
    match &failure.error {
        Error::VerifyCallbackFailed { message, output, .. } => {
            assert!(message.contains("never printed"), "{}", message);
            assert!(output.stdout.contains("start"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(report.duration < Duration::from_secs(10), "took {:?}", report.duration);
    assert_eq!(ctx.workspaces_left(), 0);
}

#[tokio::test]
async fn test_failed_workspace_preserved_when_configured() {
    let mut ctx = TestContext::shell();
    ctx.options.preserve_on_failure = true;
    let scenario = Scenario::new("preserved", vec![sh("touch evidence.txt; exit 1")]);

    let report = ctx.run(&scenario).await;

    assert!(!report.passed);
    let kept = report.kept_workspace.expect("Workspace should be kept");
    assert!(kept.join("evidence.txt").exists());
    fs::remove_dir_all(kept).ok();
}

#[tokio::test]
async fn test_process_group_kill_leaves_no_survivors() {
    let ctx = TestContext::shell();
    let pids = Arc::new(Mutex::new(Vec::new()));
    let seen = pids.clone();

    let scenario = Scenario::new(
        "tree",
        vec![sh("sleep 60 & echo child=$!; echo ready; wait")
            .keep_running()
            .output_contains(["ready"])
            .verify(verify_fn(move |ctx| {
                let seen = seen.clone();
                async move {
                    let process = ctx.process()?;
                    let stdout = process.stdout().snapshot();
                    let child = stdout
                        .lines()
                        .find_map(|l| l.strip_prefix("child="))
                        .and_then(|p| p.trim().parse::<u32>().ok())
                        .ok_or_else(|| Error::Assertion(format!("no child pid in {:?}", stdout)))?;
                    let mut seen = seen.lock().unwrap();
                    seen.extend(process.pid());
                    seen.push(child);
                    Ok(())
                }
            }))],
    );

    let report = ctx.run(&scenario).await;
    assert_passed(&report);

    let pids = pids.lock().unwrap().clone();
    assert_eq!(pids.len(), 2);
    for pid in pids {
        assert!(wait_until_gone(pid).await, "process {} survived the scenario", pid);
    }
}

#[tokio::test]
async fn test_verify_error_after_kill_still_cleans_up() {
    let ctx = TestContext::shell();
    let scenario = Scenario::new(
        "verify_error",
        vec![sh("echo up; echo DIAG >&2; sleep 60")
            .keep_running()
            .output_contains(["up"])
            .verify(verify_fn(|ctx| async move {
                ctx.kill().await;
                ctx.kill().await;
                Err(Error::Assertion("response was wrong".to_string()))
            }))],
    );

    let report = ctx.run(&scenario).await;

    let failure = report.failure.expect("Expected a failure");
    match &failure.error {
        Error::VerifyCallbackFailed {
            step, message, output, ..
        } => {
            assert_eq!(*step, 1);
            assert!(message.contains("response was wrong"));
            assert!(output.stdout.contains("up"), "{:?}", output);
            assert!(output.stderr.contains("DIAG"), "{:?}", output);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(ctx.workspaces_left(), 0);
}

#[tokio::test]
async fn test_verify_panic_is_reported() {
    let ctx = TestContext::shell();
    let scenario = Scenario::new(
        "verify_panic",
        vec![sh("echo up; sleep 60")
            .keep_running()
            .output_contains(["up"])
            .verify(verify_fn(|_| async {
                if true {
                    panic!("assertion exploded");
                }
                Ok(())
            }))],
    );

    let report = ctx.run(&scenario).await;

    let failure = report.failure.expect("Expected a failure");
    assert!(
        matches!(&failure.error, Error::VerifyCallbackFailed { message, .. } if message.contains("assertion exploded")),
        "{}",
        failure.error
    );
}

#[tokio::test]
async fn test_missing_program_fails_scenario() {
    let ctx = TestContext::new("/nonexistent/cli-under-test");
    let scenario = Scenario::new("no_cli", vec![Step::new(["--version"]).unwrap()]);

    let report = ctx.run(&scenario).await;

    let failure = report.failure.expect("Expected a failure");
    assert!(matches!(failure.error, Error::Spawn { .. }));
    assert_eq!(ctx.workspaces_left(), 0);
}

#[tokio::test]
async fn test_run_all_keeps_order() {
    let ctx = TestContext::shell();
    let scenarios: Vec<Scenario> = (0..4)
        .map(|i| Scenario::new(format!("s{}", i), vec![sh(&format!("sleep 0.{}", 4 - i))]))
        .collect();

    let reports = ScenarioRunner::new(ctx.options.clone()).run_all(&scenarios, 4).await;

    let names: Vec<_> = reports.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["s0", "s1", "s2", "s3"]);
    assert!(reports.iter().all(|r| r.passed));
}

// ============== HTTP readiness ==============

#[tokio::test]
async fn test_http_readiness_is_bounded() {
    let probe = HttpProbe::localhost(free_port(), Duration::from_millis(500)).unwrap();
    let policy = RetryPolicy::new(3, Duration::from_millis(100));

    let started = Instant::now();
    let ready = probe.wait_until_ready("/admin/host/ping", policy).await;

    assert!(!ready);
    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
}

// ============== Mock host scenarios ==============

const NODE_START: &str = r#"
name: node_start
steps:
  - commands:
      - init . --worker-runtime node
      - new --template "Http trigger" --name HttpTrigger
      - start --port 7391
    expect_exit: false
    output_contains:
      - "Http Functions:"
      - "HttpTrigger: [GET,POST] http://localhost:7391/api/HttpTrigger"
    verify:
      - action: wait_ready
        port: 7391
      - action: http_get
        port: 7391
        path: /api/HttpTrigger?name=Test
        body: Hello Test
      - action: http_get
        port: 7391
        path: /api/Missing
        status: 404
      - action: kill
"#;

#[tokio::test]
async fn test_mock_host_start_and_http() {
    let mut ctx = TestContext::mock_host();
    ctx.options.keep_workspace = true;
    let scenario = parse_scenario(NODE_START, Path::new("node_start.yaml")).unwrap();

    let report = ctx.run(&scenario).await;
    assert_passed(&report);

    // The host's worker process must be gone too
    let workspace = report.kept_workspace.expect("Workspace should be kept");
    let worker = fs::read_to_string(workspace.join("worker.pid")).expect("Worker never started");
    let worker: u32 = worker.trim().parse().unwrap();
    assert!(wait_until_gone(worker).await, "worker {} survived the scenario", worker);
    fs::remove_dir_all(workspace).ok();
}

#[tokio::test]
async fn test_mock_host_port_conflict_reported_by_cli() {
    let ctx = TestContext::mock_host();
    let reservation = PortReservation::acquire(0).unwrap();
    let port = reservation.port();
    let scenario = Scenario::new(
        "port_conflict",
        vec![Step::new([
            "init . --worker-runtime node".to_string(),
            format!("start --port {}", port),
        ])
        .unwrap()
        .expect_error_exit([format!("Port {} is unavailable", port)])],
    );

    let report = ctx.run(&scenario).await;
    assert_passed(&report);
    drop(reservation);
}

#[tokio::test]
async fn test_reserved_port_blocks_mock_host() {
    let ctx = TestContext::mock_host();
    let scenario = Scenario::new(
        "reserved_port",
        vec![Step::new(["init . --worker-runtime node", "start --port 7395"])
            .unwrap()
            .expect_error_exit(["Port 7395 is unavailable"])],
    )
    .reserve_port(7395);

    let report = ctx.run(&scenario).await;
    assert_passed(&report);

    // Released with the scenario
    let again = PortReservation::acquire(7395).expect("Port still held after the scenario");
    drop(again);
}

#[tokio::test]
async fn test_reservation_conflict_fails_before_first_step() {
    let ctx = TestContext::mock_host();
    let held = PortReservation::acquire(7396).unwrap();
    let scenario = Scenario::new(
        "reservation_conflict",
        vec![Step::new(["init . --worker-runtime node"]).unwrap()],
    )
    .reserve_port(7396);

    let report = ctx.run(&scenario).await;

    let failure = report.failure.expect("Expected a failure");
    assert_eq!(failure.step, 0);
    assert_eq!(report.steps_run, 0);
    assert_eq!(ctx.workspaces_left(), 0);
    drop(held);
}

const INVALID_FUNCTION_JSON: &str = r#"
name: invalid_function_json
steps:
  - commands:
      - init . --worker-runtime node
      - new --template "Http Trigger" --name HttpTriggerJS
    verify:
      - action: replace_in_file
        path: HttpTriggerJS/function.json
        from: '"type": "http"'
        to: '"type": "http2"'
  - commands:
      - start --port 7392
    expect_exit: false
    output_contains:
      - "The binding type(s) 'http2' are not registered."
    verify:
      - action: kill
"#;

#[tokio::test]
async fn test_mock_host_file_edit_between_steps() {
    let ctx = TestContext::mock_host();
    let scenario = parse_scenario(INVALID_FUNCTION_JSON, Path::new("invalid.yaml")).unwrap();

    let report = ctx.run(&scenario).await;
    assert_passed(&report);
}

const MISSING_HOST_JSON: &str = r#"
name: missing_host_json
teardown_between_steps: true
steps:
  - commands:
      - init . --worker-runtime dotnet
    verify:
      - action: delete_file
        path: host.json
  - commands:
      - start --port 7393
    exit_in_error: true
    error_contains:
      - Host.json file in missing
"#;

#[tokio::test]
async fn test_mock_host_missing_host_json() {
    let ctx = TestContext::mock_host();
    let scenario = parse_scenario(MISSING_HOST_JSON, Path::new("missing.yaml")).unwrap();

    let report = ctx.run(&scenario).await;
    assert_passed(&report);
}

const INHERITED_HOST: &str = r#"
name: inherited_host
steps:
  - commands:
      - init . --worker-runtime node
      - new --template "Http trigger" --name HttpTrigger
      - start --port 7394
    expect_exit: false
    output_contains:
      - "Host started"
  - expect_exit: false
    verify:
      - action: wait_ready
        port: 7394
      - action: http_get
        port: 7394
        path: /api/HttpTrigger?name=Again
        body_contains: Again
"#;

#[tokio::test]
async fn test_mock_host_observed_by_later_step() {
    let ctx = TestContext::mock_host();
    let scenario = parse_scenario(INHERITED_HOST, Path::new("inherited.yaml")).unwrap();

    let report = ctx.run(&scenario).await;
    assert_passed(&report);
    assert_eq!(report.steps_run, 2);
}

#[test]
fn test_shipped_scenarios_parse() {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("scenarios");
    let mut count = 0;
    for entry in fs::read_dir(&dir).expect("scenarios/ missing") {
        let path = entry.unwrap().path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let scenario = load_scenario(&path).unwrap_or_else(|e| panic!("{}: {}", path.display(), e));
        assert!(!scenario.steps.is_empty());
        count += 1;
    }
    assert!(count >= 10, "expected the full scenario set, found {}", count);
}
