//! Custom verification run after a step's commands

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::common::config::HttpReadiness;
use crate::common::{Error, Result};
use crate::process::ProcessHandle;
use crate::readiness::RetryPolicy;

/// What a verifier gets to work with
#[derive(Debug, Clone)]
pub struct VerifyContext {
    /// 1-based index of the step being verified
    pub step: usize,
    pub workspace: PathBuf,
    /// The step's last spawned process, or the one inherited from an
    /// earlier step when this step spawned nothing
    pub process: Option<ProcessHandle>,
    pub kill_grace: Duration,
    pub http: HttpReadiness,
    pub output_readiness: RetryPolicy,
}

impl VerifyContext {
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn process(&self) -> Result<&ProcessHandle> {
        self.process
            .as_ref()
            .ok_or_else(|| Error::Assertion("no process is running for this step".to_string()))
    }

    /// Kill the step's process, if any. Safe to call more than once.
    pub async fn kill(&self) {
        if let Some(process) = &self.process {
            process.kill(self.kill_grace).await;
        }
    }
}

/// Filesystem or HTTP checks attached to a step
///
/// Returning an error aborts the scenario; the runner still kills any
/// live process and cleans up the workspace afterwards.
#[async_trait]
pub trait Verify: Send + Sync {
    async fn verify(&self, ctx: &VerifyContext) -> Result<()>;
}

/// Adapter turning an async closure into a [`Verify`]
pub struct VerifyFn<F>(F);

#[async_trait]
impl<F, Fut> Verify for VerifyFn<F>
where
    F: Fn(VerifyContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn verify(&self, ctx: &VerifyContext) -> Result<()> {
        (self.0)(ctx.clone()).await
    }
}

/// Wrap an async closure as a step verifier
///
/// ```no_run
/// use harness::scenario::{verify_fn, Step};
///
/// let step = Step::new(["start"]).unwrap().keep_running().verify(verify_fn(|ctx| async move {
///     tokio::fs::write(ctx.workspace().join("touched"), "1").await?;
///     ctx.kill().await;
///     Ok(())
/// }));
/// ```
pub fn verify_fn<F, Fut>(f: F) -> Arc<dyn Verify>
where
    F: Fn(VerifyContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(VerifyFn(f))
}
