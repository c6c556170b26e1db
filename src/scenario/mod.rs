//! Scenarios: ordered CLI steps sharing a workspace
//!
//! Scenarios can be built in code with [`Step`] and [`Scenario`], or loaded
//! from YAML files whose verification is a list of declarative
//! [`Action`]s. Either way they are executed by the [`ScenarioRunner`].

mod actions;
mod file;
mod runner;
mod step;
mod verify;

pub use actions::{Action, Actions};
pub use file::{load_scenario, parse_scenario, ScenarioFile, StepFile};
pub use runner::{RunnerOptions, ScenarioReport, ScenarioRunner, StepFailure, StepPhase};
pub use step::{Scenario, Step, Termination};
pub use verify::{verify_fn, Verify, VerifyContext, VerifyFn};
