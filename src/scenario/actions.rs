//! Declarative verification actions for YAML scenarios
//!
//! Each action is one filesystem edit, HTTP check or process operation.
//! Actions run in order and stop at the first failure. File edits are
//! flushed to disk before the action returns, so the next command always
//! sees them.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use super::verify::{Verify, VerifyContext};
use crate::common::{Error, Result};
use crate::http::HttpProbe;
use crate::matcher::{await_substring, MatchOutcome};
use crate::readiness::wait_for_output;

/// Port the CLI's host listens on unless told otherwise
const DEFAULT_HOST_PORT: u16 = 7071;

fn default_port() -> u16 {
    DEFAULT_HOST_PORT
}

/// A single verification action
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Poll the host's health endpoint until it answers
    WaitReady {
        #[serde(default = "default_port")]
        port: u16,
        /// Override of the configured health path
        health_path: Option<String>,
    },
    /// GET a path on the host and check the response
    HttpGet {
        #[serde(default = "default_port")]
        port: u16,
        path: String,
        /// Expected status (default: any 2xx)
        status: Option<u16>,
        /// Expected exact body
        body: Option<String>,
        /// Expected body substring
        body_contains: Option<String>,
    },
    /// Replace every occurrence of `from` with `to` in a workspace file
    ReplaceInFile { path: PathBuf, from: String, to: String },
    /// Create or overwrite a workspace file
    WriteFile { path: PathBuf, content: String },
    /// Delete a workspace file
    DeleteFile { path: PathBuf },
    /// Give the process time to finish printing diagnostics
    Sleep { secs: f64 },
    /// Wait for text to appear in the process's stdout. Without
    /// `timeout_secs` the output readiness policy applies.
    AwaitOutput {
        text: String,
        timeout_secs: Option<u64>,
    },
    /// Kill the step's process and its children
    Kill,
}

/// An ordered list of actions used as a step verifier
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Actions(pub Vec<Action>);

#[async_trait]
impl Verify for Actions {
    async fn verify(&self, ctx: &VerifyContext) -> Result<()> {
        for (i, action) in self.0.iter().enumerate() {
            tracing::debug!(step = ctx.step, action = i + 1, ?action, "Running verify action");
            action.run(ctx).await?;
        }
        Ok(())
    }
}

impl Action {
    /// Reject arguments that could never run, before the scenario starts
    pub(crate) fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Action::Sleep { secs } => sleep_duration(*secs).map(|_| ()),
            _ => Ok(()),
        }
    }

    pub async fn run(&self, ctx: &VerifyContext) -> Result<()> {
        match self {
            Action::WaitReady { port, health_path } => {
                let probe = HttpProbe::localhost(*port, ctx.http.request_timeout())?;
                let path = health_path.as_deref().unwrap_or(&ctx.http.health_path);
                let policy = ctx.http.policy();
                if probe.wait_until_ready(path, policy).await {
                    Ok(())
                } else {
                    Err(Error::TimedOut {
                        what: format!(
                            "host at {} to become ready ({} attempts)",
                            probe.url(path),
                            policy.attempts
                        ),
                        waited: policy.max_wait(),
                        output: ctx.process.as_ref().map(|p| p.captured()).unwrap_or_default(),
                    })
                }
            }
            Action::HttpGet {
                port,
                path,
                status,
                body,
                body_contains,
            } => {
                let probe = HttpProbe::localhost(*port, ctx.http.request_timeout())?;
                let response = probe.get(path).await?;
                check_response(path, &response, *status, body.as_deref(), body_contains.as_deref())
            }
            Action::ReplaceInFile { path, from, to } => {
                let path = resolve(ctx.workspace(), path)?;
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| Error::file_access(&path, e))?;
                if !content.contains(from.as_str()) {
                    return Err(Error::Assertion(format!(
                        "'{}' does not contain '{}'",
                        path.display(),
                        from
                    )));
                }
                write_synced(&path, &content.replace(from.as_str(), to)).await
            }
            Action::WriteFile { path, content } => {
                let path = resolve(ctx.workspace(), path)?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| Error::file_access(parent, e))?;
                }
                write_synced(&path, content).await
            }
            Action::DeleteFile { path } => {
                let path = resolve(ctx.workspace(), path)?;
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| Error::file_access(&path, e))
            }
            Action::Sleep { secs } => {
                let duration = sleep_duration(*secs).map_err(Error::Assertion)?;
                tokio::time::sleep(duration).await;
                Ok(())
            }
            Action::AwaitOutput { text, timeout_secs } => {
                let process = ctx.process()?;
                let Some(secs) = timeout_secs else {
                    let policy = ctx.output_readiness;
                    if wait_for_output(process.stdout(), text, policy).await {
                        return Ok(());
                    }
                    return Err(if process.stdout().is_closed() {
                        Error::MissingOutputText {
                            text: text.clone(),
                            output: process.captured(),
                        }
                    } else {
                        Error::TimedOut {
                            what: format!("'{text}' in stdout"),
                            waited: policy.max_wait(),
                            output: process.captured(),
                        }
                    });
                };
                let timeout = Duration::from_secs(*secs);
                match await_substring(process.stdout(), text, timeout).await {
                    MatchOutcome::Found => Ok(()),
                    MatchOutcome::NotFoundWithinTimeout => Err(Error::TimedOut {
                        what: format!("'{text}' in stdout"),
                        waited: timeout,
                        output: process.captured(),
                    }),
                    MatchOutcome::StreamClosed => Err(Error::MissingOutputText {
                        text: text.clone(),
                        output: process.captured(),
                    }),
                }
            }
            Action::Kill => {
                ctx.kill().await;
                Ok(())
            }
        }
    }
}

fn check_response(
    path: &str,
    response: &crate::http::HttpResponse,
    status: Option<u16>,
    body: Option<&str>,
    body_contains: Option<&str>,
) -> Result<()> {
    match status {
        Some(expected) if response.status != expected => {
            return Err(Error::Assertion(format!(
                "GET {} returned status {}, expected {}",
                path, response.status, expected
            )));
        }
        None if !response.is_success() => {
            return Err(Error::Assertion(format!(
                "GET {} returned status {}, expected success",
                path, response.status
            )));
        }
        _ => {}
    }
    if let Some(expected) = body {
        if response.body != expected {
            return Err(Error::Assertion(format!(
                "GET {} returned body '{}', expected '{}'",
                path, response.body, expected
            )));
        }
    }
    if let Some(expected) = body_contains {
        if !response.body.contains(expected) {
            return Err(Error::Assertion(format!(
                "GET {} returned body '{}', expected it to contain '{}'",
                path, response.body, expected
            )));
        }
    }
    Ok(())
}

/// Resolve a workspace-relative path, refusing anything that escapes it
fn resolve(workspace: &Path, relative: &Path) -> Result<PathBuf> {
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || relative.as_os_str().is_empty() {
        return Err(Error::Assertion(format!(
            "path '{}' must be relative to the workspace",
            relative.display()
        )));
    }
    Ok(workspace.join(relative))
}

async fn write_synced(path: &Path, content: &str) -> Result<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| Error::file_access(path, e))?;
    file.write_all(content.as_bytes())
        .await
        .map_err(|e| Error::file_access(path, e))?;
    file.sync_all().await.map_err(|e| Error::file_access(path, e))
}

fn sleep_duration(secs: f64) -> std::result::Result<Duration, String> {
    Duration::try_from_secs_f64(secs).map_err(|e| format!("sleep of {secs} seconds: {e}"))
}
