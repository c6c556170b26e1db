//! Scenario and step data model

use std::fmt;
use std::sync::Arc;

use super::verify::Verify;
use crate::common::Result;
use crate::process::CommandLine;

/// How the final command of a step is expected to end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The process exits on its own and is scored on its exit status
    Exit {
        /// Exit must be non-zero
        in_error: bool,
        /// Substrings that must appear in stderr
        error_contains: Vec<String>,
    },
    /// The process keeps running; scored on output and verification,
    /// killed by the verifier or at scenario cleanup
    KeepRunning,
}

impl Termination {
    pub fn success() -> Self {
        Termination::Exit {
            in_error: false,
            error_contains: Vec::new(),
        }
    }
}

/// One unit of command execution plus its expected outcome
#[derive(Clone)]
pub struct Step {
    pub commands: Vec<CommandLine>,
    pub termination: Termination,
    pub output_contains: Vec<String>,
    pub output_doesnt_contain: Vec<String>,
    pub verify: Option<Arc<dyn Verify>>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("commands", &self.commands)
            .field("termination", &self.termination)
            .field("output_contains", &self.output_contains)
            .field("output_doesnt_contain", &self.output_doesnt_contain)
            .field("verify", &self.verify.is_some())
            .finish()
    }
}

impl Step {
    /// A step running `commands` in order, expected to exit successfully
    pub fn new<I, S>(commands: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let commands = commands
            .into_iter()
            .map(|c| CommandLine::parse(c.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            commands,
            termination: Termination::success(),
            output_contains: Vec::new(),
            output_doesnt_contain: Vec::new(),
            verify: None,
        })
    }

    /// A step that issues no command and only verifies, e.g. probing a
    /// host left running by an earlier step
    pub fn observe() -> Self {
        Self {
            commands: Vec::new(),
            termination: Termination::KeepRunning,
            output_contains: Vec::new(),
            output_doesnt_contain: Vec::new(),
            verify: None,
        }
    }

    /// Expect the last command to fail with the given stderr text
    pub fn expect_error_exit<I, S>(mut self, error_contains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.termination = Termination::Exit {
            in_error: true,
            error_contains: error_contains.into_iter().map(Into::into).collect(),
        };
        self
    }

    /// Leave the last command running
    pub fn keep_running(mut self) -> Self {
        self.termination = Termination::KeepRunning;
        self
    }

    pub fn output_contains<I, S>(mut self, texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_contains.extend(texts.into_iter().map(Into::into));
        self
    }

    pub fn output_doesnt_contain<I, S>(mut self, texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_doesnt_contain.extend(texts.into_iter().map(Into::into));
        self
    }

    pub fn verify(mut self, verify: Arc<dyn Verify>) -> Self {
        self.verify = Some(verify);
        self
    }

    pub fn expects_exit(&self) -> bool {
        matches!(self.termination, Termination::Exit { .. })
    }
}

/// An ordered list of steps sharing one workspace
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<Step>,
    /// Kill a process left running by one step before the next step starts
    pub teardown_between_steps: bool,
    /// Ports held busy for the whole scenario
    pub reserve_ports: Vec<u16>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps,
            teardown_between_steps: false,
            reserve_ports: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn teardown_between_steps(mut self, teardown: bool) -> Self {
        self.teardown_between_steps = teardown;
        self
    }

    pub fn reserve_port(mut self, port: u16) -> Self {
        self.reserve_ports.push(port);
        self
    }
}
