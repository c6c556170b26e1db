//! Process handle for one spawned CLI invocation
//!
//! The handle starts draining stdout and stderr the moment the process is
//! spawned, so a chatty CLI can never block on a full pipe. The child is
//! owned by a reaper task; the handle itself is a cheap clone that can be
//! passed to verification callbacks while the runner keeps its own copy.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use super::buffer::{OutputBuffer, Utf8Decoder};
use super::command_line::CommandLine;
use crate::common::{CapturedOutput, Error, Result};

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    /// Whether the harness killed the process
    pub killed: bool,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Handle to a spawned process. Clones share the same process.
#[derive(Clone)]
pub struct ProcessHandle {
    shared: Arc<Shared>,
}

struct Shared {
    command: String,
    pid: Option<u32>,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    combined: OutputBuffer,
    exit: watch::Receiver<Option<ExitOutcome>>,
    kill_tx: mpsc::UnboundedSender<()>,
    kill_requested: Arc<AtomicBool>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("command", &self.shared.command)
            .field("pid", &self.shared.pid)
            .field("exit", &*self.shared.exit.borrow())
            .finish()
    }
}

impl ProcessHandle {
    /// Spawn `program` with the arguments of `command` inside `working_dir`
    ///
    /// On Unix the process becomes the leader of a new process group so
    /// that [`ProcessHandle::kill`] can take down any workers it forks.
    pub fn spawn(
        program: &Path,
        command: &CommandLine,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let command_display = format!("{} {}", program.display(), command);

        let mut cmd = Command::new(program);
        cmd.args(command.args())
            .current_dir(working_dir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| Error::spawn(&command_display, e))?;
        let pid = child.id();
        tracing::debug!(command = %command_display, ?pid, "Spawned process");

        let stdout = OutputBuffer::new();
        let stderr = OutputBuffer::new();
        let combined = OutputBuffer::new();

        if let Some(pipe) = child.stdout.take() {
            tokio::spawn(drain(pipe, stdout.clone(), combined.clone()));
        } else {
            stdout.close();
        }
        if let Some(pipe) = child.stderr.take() {
            tokio::spawn(drain(pipe, stderr.clone(), combined.clone()));
        } else {
            stderr.close();
        }
        {
            let (stdout, stderr, combined) = (stdout.clone(), stderr.clone(), combined.clone());
            tokio::spawn(async move {
                stdout.closed().await;
                stderr.closed().await;
                combined.close();
            });
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<()>();
        let kill_requested = Arc::new(AtomicBool::new(false));
        let reaper_kill_requested = kill_requested.clone();

        tokio::spawn(async move {
            // A kill request, or every handle being dropped, ends the wait
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx.recv() => None,
            };
            let (status, killed) = match waited {
                // The group signal may reach the child before the kill message
                Some(status) => (status, reaper_kill_requested.load(Ordering::SeqCst)),
                None => {
                    let _ = child.start_kill();
                    (child.wait().await, true)
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!("Failed to wait for process: {}", e);
                    None
                }
            };
            let _ = exit_tx.send(Some(ExitOutcome { code, killed }));
        });

        Ok(Self {
            shared: Arc::new(Shared {
                command: command_display,
                pid,
                stdout,
                stderr,
                combined,
                exit: exit_rx,
                kill_tx,
                kill_requested,
            }),
        })
    }

    /// The command line as spawned, program included
    pub fn command(&self) -> &str {
        &self.shared.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    pub fn stdout(&self) -> &OutputBuffer {
        &self.shared.stdout
    }

    pub fn stderr(&self) -> &OutputBuffer {
        &self.shared.stderr
    }

    /// Stdout and stderr interleaved in arrival order
    pub fn combined(&self) -> &OutputBuffer {
        &self.shared.combined
    }

    /// Lazy sequence of stdout chunks, ending when the process closes the stream
    pub fn stdout_chunks(&self) -> impl Stream<Item = String> + Send + 'static {
        self.shared.stdout.chunks()
    }

    /// Lazy sequence of stderr chunks, ending when the process closes the stream
    pub fn stderr_chunks(&self) -> impl Stream<Item = String> + Send + 'static {
        self.shared.stderr.chunks()
    }

    /// Snapshot of both streams, for diagnostics
    pub fn captured(&self) -> CapturedOutput {
        CapturedOutput {
            stdout: self.shared.stdout.snapshot(),
            stderr: self.shared.stderr.snapshot(),
        }
    }

    /// Exit outcome if the process has already ended
    pub fn try_exit(&self) -> Option<ExitOutcome> {
        *self.shared.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.try_exit().is_some()
    }

    /// Wait for the process to end on its own
    pub async fn wait_for_exit(&self, timeout: Duration) -> Result<ExitOutcome> {
        let mut rx = self.shared.exit.clone();
        let _ = tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await;
        self.try_exit().ok_or_else(|| Error::TimedOut {
            what: format!("'{}' to exit", self.shared.command),
            waited: timeout,
            output: self.captured(),
        })
    }

    /// Wait until both output streams are closed, bounded by `timeout`
    ///
    /// Returns false if a stream is still open, e.g. held by a forked
    /// worker that outlived its parent.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let both = async {
            self.shared.stdout.closed().await;
            self.shared.stderr.closed().await;
        };
        tokio::time::timeout(timeout, both).await.is_ok()
    }

    /// Terminate the process and everything in its process group
    ///
    /// Idempotent: killing an exited process is a no-op apart from sweeping
    /// any workers it left behind in its group.
    pub async fn kill(&self, grace: Duration) {
        if !self.has_exited() {
            self.shared.kill_requested.store(true, Ordering::SeqCst);
        }
        if self.shared.group_may_exist() {
            self.shared.kill_group();
        }
        let _ = self.shared.kill_tx.send(());
        if self.wait_for_exit(grace).await.is_err() {
            tracing::warn!(command = %self.shared.command, "Process did not exit after kill");
        }
    }

}

impl Shared {
    /// Whether the process group can still have members
    ///
    /// Once the leader is reaped and both pipes hit EOF nothing from this
    /// spawn is left, and the pgid may already belong to someone else.
    /// A worker that still holds a pipe keeps the group, and its id, alive.
    fn group_may_exist(&self) -> bool {
        self.exit.borrow().is_none() || !self.stdout.is_closed() || !self.stderr.is_closed()
    }

    #[cfg(unix)]
    fn kill_group(&self) {
        if let Some(pid) = self.pid {
            // The child was spawned as its own group leader, so pgid == pid.
            // ESRCH just means the whole group is already gone.
            unsafe {
                libc::killpg(pid as libc::pid_t, libc::SIGKILL);
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&self) {}
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Last handle gone: make sure nothing from this spawn survives.
        // The reaper kills the direct child once kill_tx is dropped.
        if self.group_may_exist() {
            self.kill_group();
        }
    }
}

/// Copy a pipe into its own buffer and the combined buffer until EOF
async fn drain<R>(mut pipe: R, own: OutputBuffer, combined: OutputBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = Utf8Decoder::default();
    let mut buf = vec![0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.push(&buf[..n]);
                own.append(&text);
                combined.append(&text);
            }
            Err(e) => {
                tracing::debug!("Output pipe read failed: {}", e);
                break;
            }
        }
    }
    let rest = decoder.finish();
    own.append(&rest);
    combined.append(&rest);
    own.close();
}
