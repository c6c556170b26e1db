//! CLI Harness - black-box scenario testing for CLIs that start local hosts
//!
//! This library drives a command-line tool through ordered steps in an
//! isolated workspace, watches its output and exit status, and probes the
//! host it starts over HTTP.

pub mod cli;
pub mod commands;
pub mod common;
pub mod http;
pub mod matcher;
pub mod port;
pub mod process;
pub mod readiness;
pub mod scenario;
pub mod workspace;

// Re-export commonly used types for tests
pub use common::{CapturedOutput, Error, Result};
pub use scenario::{Scenario, ScenarioRunner, Step};
