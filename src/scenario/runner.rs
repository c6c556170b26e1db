//! Scenario runner
//!
//! Executes the steps of a scenario in order inside one workspace. Each
//! step moves through [`StepPhase`]s; the first failure aborts the rest of
//! the scenario. Whatever happens, every process spawned by the scenario
//! is killed and the workspace is cleaned up before the report is returned.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::{stream, FutureExt, StreamExt};
use tracing::Instrument;

use super::step::{Scenario, Step, Termination};
use super::verify::VerifyContext;
use crate::common::config::{Config, ReadinessConfig, Timeouts};
use crate::common::{paths, CapturedOutput, Error, Result};
use crate::matcher::{await_substring, MatchOutcome};
use crate::port::PortReservation;
use crate::process::{CommandLine, ExitOutcome, ProcessHandle};
use crate::workspace::Workspace;

/// How long to wait for output pipes to close after a process exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Progress of a step, reported with failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    NotStarted,
    CommandsIssued,
    NaturallyExited,
    StillRunning,
    Verified,
    Scored,
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepPhase::NotStarted => "not started",
            StepPhase::CommandsIssued => "commands issued",
            StepPhase::NaturallyExited => "exited",
            StepPhase::StillRunning => "still running",
            StepPhase::Verified => "verified",
            StepPhase::Scored => "scored",
        };
        f.write_str(name)
    }
}

/// Why a scenario failed
#[derive(Debug)]
pub struct StepFailure {
    /// 1-based step index; 0 for failures before the first step
    pub step: usize,
    pub phase: StepPhase,
    /// The command being scored when the failure happened
    pub command: Option<String>,
    pub error: Error,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.step == 0 {
            write!(f, "Scenario setup failed: {}", self.error)
        } else {
            write!(f, "Step {} ({})", self.step, self.phase)?;
            if let Some(command) = &self.command {
                write!(f, " `{}`", command)?;
            }
            write!(f, ": {}", self.error)
        }
    }
}

/// Result of a scenario run
#[derive(Debug)]
pub struct ScenarioReport {
    pub name: String,
    pub passed: bool,
    pub steps_run: usize,
    pub steps_total: usize,
    pub failure: Option<StepFailure>,
    /// Workspace left on disk for inspection
    pub kept_workspace: Option<PathBuf>,
    pub duration: Duration,
}

/// Settings the runner needs, resolved from [`Config`]
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Executable of the CLI under test
    pub program: PathBuf,
    pub env: HashMap<String, String>,
    pub timeouts: Timeouts,
    pub readiness: ReadinessConfig,
    pub workspace_root: PathBuf,
    pub preserve_on_failure: bool,
    /// Keep workspaces even for passing scenarios
    pub keep_workspace: bool,
}

impl RunnerOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            env: HashMap::new(),
            timeouts: Timeouts::default(),
            readiness: ReadinessConfig::default(),
            workspace_root: paths::default_workspace_root(),
            preserve_on_failure: false,
            keep_workspace: false,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            program: config.resolve_program()?,
            env: config.cli.env.clone(),
            timeouts: config.timeouts.clone(),
            readiness: config.readiness.clone(),
            workspace_root: config
                .workspace
                .base_dir
                .clone()
                .unwrap_or_else(paths::default_workspace_root),
            preserve_on_failure: config.workspace.preserve_on_failure,
            keep_workspace: false,
        })
    }
}

/// Processes spawned by one scenario
#[derive(Default)]
struct Session {
    /// Every handle ever spawned, for cleanup
    spawned: Vec<ProcessHandle>,
    /// Process left running by the most recent keep-running step
    live: Option<ProcessHandle>,
}

impl Session {
    async fn kill_live(&mut self, grace: Duration) {
        if let Some(live) = self.live.take() {
            tracing::debug!(command = live.command(), "Tearing down running process");
            live.kill(grace).await;
        }
    }

    async fn kill_all(&mut self, grace: Duration) {
        self.live = None;
        for handle in self.spawned.drain(..) {
            handle.kill(grace).await;
        }
    }
}

/// Runs scenarios against the CLI under test
#[derive(Debug, Clone)]
pub struct ScenarioRunner {
    options: RunnerOptions,
}

impl ScenarioRunner {
    pub fn new(options: RunnerOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Run several scenarios, at most `jobs` at a time. Reports keep the
    /// order of `scenarios`.
    pub async fn run_all(&self, scenarios: &[Scenario], jobs: usize) -> Vec<ScenarioReport> {
        stream::iter(scenarios)
            .map(|scenario| self.run(scenario))
            .buffered(jobs.max(1))
            .collect()
            .await
    }

    /// Run one scenario to completion or first failure
    pub async fn run(&self, scenario: &Scenario) -> ScenarioReport {
        let span = tracing::info_span!("scenario", name = %scenario.name);
        self.run_scenario(scenario).instrument(span).await
    }

    async fn run_scenario(&self, scenario: &Scenario) -> ScenarioReport {
        let started = Instant::now();
        let steps_total = scenario.steps.len();
        tracing::info!(steps = steps_total, "Running scenario");

        let failed = |failure: StepFailure| ScenarioReport {
            name: scenario.name.clone(),
            passed: false,
            steps_run: 0,
            steps_total,
            failure: Some(failure),
            kept_workspace: None,
            duration: started.elapsed(),
        };
        let setup_failure = |error: Error| StepFailure {
            step: 0,
            phase: StepPhase::NotStarted,
            command: None,
            error,
        };

        let mut reservations = Vec::with_capacity(scenario.reserve_ports.len());
        for port in &scenario.reserve_ports {
            match PortReservation::acquire(*port) {
                Ok(reservation) => reservations.push(reservation),
                Err(e) => return failed(setup_failure(e)),
            }
        }

        let workspace = match Workspace::allocate(&self.options.workspace_root, &scenario.name) {
            Ok(workspace) => workspace,
            Err(e) => return failed(setup_failure(e)),
        };

        let mut session = Session::default();
        let mut failure = None;
        let mut steps_run = 0;

        for (i, step) in scenario.steps.iter().enumerate() {
            let index = i + 1;
            if scenario.teardown_between_steps {
                session.kill_live(self.options.timeouts.kill_grace()).await;
            }

            steps_run = index;
            match self.run_step(index, step, workspace.path(), &mut session).await {
                Ok(()) => tracing::info!(step = index, "Step passed"),
                Err(step_failure) => {
                    tracing::warn!(step = index, kind = step_failure.error.kind(), "{}", step_failure);
                    failure = Some(step_failure);
                    break;
                }
            }
        }

        session.kill_all(self.options.timeouts.kill_grace()).await;
        drop(reservations);

        let passed = failure.is_none();
        let keep = self.options.keep_workspace || (!passed && self.options.preserve_on_failure);
        let kept_workspace = workspace.finish(keep);

        ScenarioReport {
            name: scenario.name.clone(),
            passed,
            steps_run,
            steps_total,
            failure,
            kept_workspace,
            duration: started.elapsed(),
        }
    }

    fn spawn(&self, command: &CommandLine, workspace: &Path, session: &mut Session) -> Result<ProcessHandle> {
        let handle = ProcessHandle::spawn(&self.options.program, command, workspace, &self.options.env)?;
        session.spawned.push(handle.clone());
        Ok(handle)
    }

    async fn run_step(
        &self,
        index: usize,
        step: &Step,
        workspace: &Path,
        session: &mut Session,
    ) -> std::result::Result<(), StepFailure> {
        let mut phase = StepPhase::NotStarted;
        let mut current: Option<String> = None;
        let fail = |phase: StepPhase, command: &Option<String>, error: Error| StepFailure {
            step: index,
            phase,
            command: command.clone(),
            error,
        };

        // Stdout of commands in this step that already finished
        let mut transcript = String::new();

        // One budget covers every command of the step
        let deadline = Instant::now() + self.options.timeouts.step();

        let process = if let Some((last, setup)) = step.commands.split_last() {
            for command in setup {
                current = Some(command.to_string());
                tracing::info!(step = index, command = %command, "Running");
                let output = self
                    .run_to_success(command, workspace, session, deadline)
                    .await
                    .map_err(|e| fail(phase, &current, e))?;
                transcript.push_str(&output);
            }

            current = Some(last.to_string());
            tracing::info!(step = index, command = %last, "Running");
            let handle = self
                .spawn(last, workspace, session)
                .map_err(|e| fail(phase, &current, e))?;
            phase = StepPhase::CommandsIssued;
            tracing::debug!(step = index, %phase);

            match &step.termination {
                Termination::Exit {
                    in_error,
                    error_contains,
                } => {
                    let outcome = self
                        .wait_for_natural_exit(&handle, deadline)
                        .await
                        .map_err(|e| fail(phase, &current, e))?;
                    phase = StepPhase::NaturallyExited;
                    tracing::debug!(step = index, %phase, code = ?outcome.code);

                    if *in_error == outcome.success() {
                        return Err(fail(
                            phase,
                            &current,
                            Error::UnexpectedExitCode {
                                expected_error: *in_error,
                                code: outcome.code,
                                output: handle.captured(),
                            },
                        ));
                    }
                    let stderr = handle.stderr().snapshot();
                    if let Some(text) = error_contains.iter().find(|t| !stderr.contains(t.as_str())) {
                        return Err(fail(
                            phase,
                            &current,
                            Error::MissingErrorText {
                                text: text.clone(),
                                output: handle.captured(),
                            },
                        ));
                    }
                    check_final_output(step, &transcript, &handle).map_err(|e| fail(phase, &current, e))?;
                }
                Termination::KeepRunning => {
                    phase = StepPhase::StillRunning;
                    tracing::debug!(step = index, %phase);
                    session.live = Some(handle.clone());
                    self.await_expected_output(step, &transcript, &handle)
                        .await
                        .map_err(|e| fail(phase, &current, e))?;
                    check_forbidden(step, &transcript, &handle).map_err(|e| fail(phase, &current, e))?;
                }
            }
            Some(handle)
        } else {
            // Observation-only step: look at whatever an earlier step left running
            phase = StepPhase::StillRunning;
            match session.live.clone() {
                Some(live) => {
                    self.await_expected_output(step, "", &live)
                        .await
                        .map_err(|e| fail(phase, &current, e))?;
                    Some(live)
                }
                None => {
                    if let Some(text) = step.output_contains.first() {
                        return Err(fail(
                            phase,
                            &current,
                            Error::MissingOutputText {
                                text: text.clone(),
                                output: CapturedOutput::default(),
                            },
                        ));
                    }
                    None
                }
            }
        };

        if let Some(verify) = &step.verify {
            let ctx = VerifyContext {
                step: index,
                workspace: workspace.to_path_buf(),
                process: process.clone(),
                kill_grace: self.options.timeouts.kill_grace(),
                http: self.options.readiness.http.clone(),
                output_readiness: self.options.readiness.output.policy(),
            };
            let result = AssertUnwindSafe(verify.verify(&ctx)).catch_unwind().await;
            let message = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            if let Some(message) = message {
                if let Some(handle) = process.as_ref().filter(|h| h.has_exited()) {
                    handle.wait_for_drain(DRAIN_TIMEOUT).await;
                }
                let output = process.as_ref().map(|p| p.captured()).unwrap_or_default();
                return Err(fail(
                    phase,
                    &current,
                    Error::VerifyCallbackFailed {
                        step: index,
                        workspace: workspace.to_path_buf(),
                        message,
                        output,
                    },
                ));
            }
            phase = StepPhase::Verified;
            tracing::debug!(step = index, %phase);
        }

        // A verifier that killed the process leaves its final output to score
        if !step.expects_exit() {
            if let Some(handle) = &process {
                if handle.has_exited() {
                    handle.wait_for_drain(DRAIN_TIMEOUT).await;
                    if session.live.as_ref().map(|l| l.pid()) == Some(handle.pid()) {
                        session.live = None;
                    }
                }
                check_forbidden(step, &transcript, handle).map_err(|e| fail(phase, &current, e))?;
            }
        }

        phase = StepPhase::Scored;
        tracing::debug!(step = index, %phase);
        Ok(())
    }

    /// Run a preparatory command that must exit with status 0
    async fn run_to_success(
        &self,
        command: &CommandLine,
        workspace: &Path,
        session: &mut Session,
        deadline: Instant,
    ) -> Result<String> {
        let handle = self.spawn(command, workspace, session)?;
        let outcome = self.wait_for_natural_exit(&handle, deadline).await?;
        if !outcome.success() {
            return Err(Error::UnexpectedExitCode {
                expected_error: false,
                code: outcome.code,
                output: handle.captured(),
            });
        }
        Ok(handle.stdout().snapshot())
    }

    /// Wait for exit before the step deadline, then for the output to drain
    async fn wait_for_natural_exit(&self, handle: &ProcessHandle, deadline: Instant) -> Result<ExitOutcome> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = match handle.wait_for_exit(remaining).await {
            Ok(outcome) => outcome,
            Err(Error::TimedOut { output, .. }) => {
                return Err(Error::UnexpectedlyStillRunning {
                    waited: self.options.timeouts.step(),
                    output,
                })
            }
            Err(e) => return Err(e),
        };
        if !handle.wait_for_drain(DRAIN_TIMEOUT).await {
            tracing::debug!(command = handle.command(), "Output still open after exit");
        }
        Ok(outcome)
    }

    /// Wait, bounded, for every `output_contains` text of a running process
    async fn await_expected_output(&self, step: &Step, transcript: &str, handle: &ProcessHandle) -> Result<()> {
        let timeout = self.options.timeouts.output();
        for text in &step.output_contains {
            if transcript.contains(text.as_str()) {
                continue;
            }
            match await_substring(handle.stdout(), text, timeout).await {
                MatchOutcome::Found => {}
                MatchOutcome::NotFoundWithinTimeout => {
                    return Err(Error::TimedOut {
                        what: format!("'{text}' in stdout"),
                        waited: timeout,
                        output: handle.captured(),
                    })
                }
                MatchOutcome::StreamClosed => {
                    return Err(Error::MissingOutputText {
                        text: text.clone(),
                        output: handle.captured(),
                    })
                }
            }
        }
        Ok(())
    }
}

/// Score `output_contains` and `output_doesnt_contain` on a finished step
fn check_final_output(step: &Step, transcript: &str, handle: &ProcessHandle) -> Result<()> {
    let stdout = handle.stdout().snapshot();
    for text in &step.output_contains {
        if !transcript.contains(text.as_str()) && !stdout.contains(text.as_str()) {
            return Err(Error::MissingOutputText {
                text: text.clone(),
                output: handle.captured(),
            });
        }
    }
    check_forbidden(step, transcript, handle)
}

fn check_forbidden(step: &Step, transcript: &str, handle: &ProcessHandle) -> Result<()> {
    let stdout = handle.stdout().snapshot();
    for text in &step.output_doesnt_contain {
        if transcript.contains(text.as_str()) || stdout.contains(text.as_str()) {
            return Err(Error::ForbiddenOutputText {
                text: text.clone(),
                output: handle.captured(),
            });
        }
    }
    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
