//! Error types for the scenario harness
//!
//! Every failure that can end a scenario carries the captured output of
//! the process it concerns, so a report alone is enough to see what the
//! CLI under test actually printed.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Snapshot of a process's stdout and stderr at the time of a failure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl fmt::Display for CapturedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- stdout ---")?;
        writeln!(f, "{}", self.stdout.trim_end())?;
        writeln!(f, "--- stderr ---")?;
        write!(f, "{}", self.stderr.trim_end())
    }
}

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum Error {
    // === Process Errors ===
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid command line '{command}': {reason}")]
    InvalidCommandLine { command: String, reason: String },

    // === Expectation Errors ===
    #[error("Timed out after {waited:?} waiting for {what}\n{output}")]
    TimedOut {
        what: String,
        waited: Duration,
        output: CapturedOutput,
    },

    #[error("Expected {} exit, got exit code {code:?}\n{output}", exit_kind(.expected_error))]
    UnexpectedExitCode {
        expected_error: bool,
        code: Option<i32>,
        output: CapturedOutput,
    },

    #[error("Process was still running after {waited:?}, expected it to exit\n{output}")]
    UnexpectedlyStillRunning {
        waited: Duration,
        output: CapturedOutput,
    },

    #[error("Expected stderr to contain '{text}'\n{output}")]
    MissingErrorText { text: String, output: CapturedOutput },

    #[error("Expected stdout to contain '{text}'\n{output}")]
    MissingOutputText { text: String, output: CapturedOutput },

    #[error("Expected stdout not to contain '{text}'\n{output}")]
    ForbiddenOutputText { text: String, output: CapturedOutput },

    #[error("Verification for step {step} failed (workspace: {}): {message}\n{output}", .workspace.display())]
    VerifyCallbackFailed {
        step: usize,
        workspace: PathBuf,
        message: String,
        output: CapturedOutput,
    },

    #[error("Assertion failed: {0}")]
    Assertion(String),

    // === Resource Errors ===
    #[error("Port {port} is already in use: {source}")]
    PortUnavailable {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Invalid scenario '{path}': {reason}")]
    ScenarioParse { path: String, reason: String },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to access file '{path}': {error}")]
    FileAccess { path: String, error: String },
}

fn exit_kind(expected_error: &bool) -> &'static str {
    if *expected_error {
        "an error"
    } else {
        "a successful"
    }
}

impl Error {
    /// Create a spawn error for a command line
    pub fn spawn(command: &str, source: io::Error) -> Self {
        Self::Spawn {
            command: command.to_string(),
            source,
        }
    }

    /// Create a file access error
    pub fn file_access(path: &std::path::Path, error: impl fmt::Display) -> Self {
        Self::FileAccess {
            path: path.display().to_string(),
            error: error.to_string(),
        }
    }

    /// Create a scenario parse error
    pub fn scenario_parse(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Self::ScenarioParse {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Short machine-friendly category, used in reports
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Spawn { .. } | Error::InvalidCommandLine { .. } => "SPAWN_ERROR",
            Error::TimedOut { .. } => "TIMED_OUT",
            Error::UnexpectedExitCode { .. } => "UNEXPECTED_EXIT_CODE",
            Error::UnexpectedlyStillRunning { .. } => "UNEXPECTEDLY_STILL_RUNNING",
            Error::MissingErrorText { .. } => "MISSING_ERROR_TEXT",
            Error::MissingOutputText { .. } => "MISSING_OUTPUT_TEXT",
            Error::ForbiddenOutputText { .. } => "FORBIDDEN_OUTPUT_TEXT",
            Error::VerifyCallbackFailed { .. } => "VERIFY_CALLBACK_FAILED",
            Error::Assertion(_) => "ASSERTION",
            Error::PortUnavailable { .. } => "PORT_UNAVAILABLE",
            Error::Http { .. } => "HTTP",
            Error::Config(_) | Error::ConfigParse(_) | Error::ScenarioParse { .. } => "CONFIG",
            Error::Io(_) | Error::FileAccess { .. } => "IO",
        }
    }
}
