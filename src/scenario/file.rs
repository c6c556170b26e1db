//! Scenario files
//!
//! Defines the YAML layout of a scenario and converts it into the typed
//! [`Scenario`] model, rejecting steps that mix exit and keep-running
//! expectations.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use super::actions::{Action, Actions};
use super::step::{Scenario, Step, Termination};
use crate::common::{Error, Result};
use crate::process::CommandLine;

/// A complete scenario loaded from a YAML file
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ScenarioFile {
    /// Name of the scenario
    pub name: String,
    /// Optional description of what the scenario verifies
    pub description: Option<String>,
    /// Kill a host left running by one step before the next step starts
    #[serde(default)]
    pub teardown_between_steps: bool,
    /// Ports to hold busy for the whole scenario
    #[serde(default)]
    pub reserve_ports: Vec<u16>,
    /// The sequence of steps to execute
    pub steps: Vec<StepFile>,
}

/// A single step as written in YAML
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct StepFile {
    /// CLI invocations, without the program name
    #[serde(default)]
    pub commands: Vec<String>,
    /// Whether the last command should exit on its own (default: true)
    #[serde(default = "default_expect_exit")]
    pub expect_exit: bool,
    /// Whether that exit must be an error
    #[serde(default)]
    pub exit_in_error: bool,
    #[serde(default)]
    pub output_contains: Vec<String>,
    #[serde(default)]
    pub output_doesnt_contain: Vec<String>,
    #[serde(default)]
    pub error_contains: Vec<String>,
    /// Actions to run after the commands
    #[serde(default)]
    pub verify: Vec<Action>,
}

fn default_expect_exit() -> bool {
    true
}

impl StepFile {
    fn into_step(self) -> std::result::Result<Step, String> {
        let termination = if self.expect_exit {
            Termination::Exit {
                in_error: self.exit_in_error,
                error_contains: self.error_contains,
            }
        } else {
            if self.exit_in_error {
                return Err("exit_in_error requires expect_exit: true".to_string());
            }
            if !self.error_contains.is_empty() {
                return Err("error_contains requires expect_exit: true".to_string());
            }
            Termination::KeepRunning
        };

        if self.commands.is_empty() && matches!(termination, Termination::Exit { .. }) {
            return Err("a step without commands must set expect_exit: false".to_string());
        }

        let commands = self
            .commands
            .iter()
            .map(|c| CommandLine::parse(c).map_err(|e| e.to_string()))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for action in &self.verify {
            action.validate()?;
        }

        let verify = if self.verify.is_empty() {
            None
        } else {
            Some(Arc::new(Actions(self.verify)) as Arc<dyn super::verify::Verify>)
        };

        Ok(Step {
            commands,
            termination,
            output_contains: self.output_contains,
            output_doesnt_contain: self.output_doesnt_contain,
            verify,
        })
    }
}

impl ScenarioFile {
    pub fn into_scenario(self, path: &Path) -> Result<Scenario> {
        if self.steps.is_empty() {
            return Err(Error::scenario_parse(path, "scenario has no steps"));
        }
        let steps = self
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, step)| {
                step.into_step()
                    .map_err(|reason| Error::scenario_parse(path, format!("step {}: {}", i + 1, reason)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Scenario {
            name: self.name,
            description: self.description,
            steps,
            teardown_between_steps: self.teardown_between_steps,
            reserve_ports: self.reserve_ports,
        })
    }
}

/// Parse scenario YAML. `path` is only used in error messages.
pub fn parse_scenario(content: &str, path: &Path) -> Result<Scenario> {
    let file: ScenarioFile =
        serde_yaml::from_str(content).map_err(|e| Error::scenario_parse(path, e.to_string()))?;
    file.into_scenario(path)
}

/// Load a scenario from a YAML file
pub fn load_scenario(path: &Path) -> Result<Scenario> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::file_access(path, e))?;
    parse_scenario(&content, path)
}
