//! Isolated working directories for scenarios

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::common::{Error, Result};

/// A uniquely named directory owned by one scenario
///
/// Removed when dropped, unless [`Workspace::finish`] decides to keep it.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh directory under `base`, named after the scenario
    pub fn allocate(base: &Path, scenario: &str) -> Result<Self> {
        std::fs::create_dir_all(base).map_err(|e| Error::file_access(base, e))?;
        let prefix = format!("{}-", sanitize(scenario));
        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(base)
            .map_err(|e| Error::file_access(base, e))?;
        tracing::debug!(path = %dir.path().display(), "Allocated workspace");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Delete the workspace, or keep it for inspection when `keep` is set
    ///
    /// Returns the path if it was kept.
    pub fn finish(self, keep: bool) -> Option<PathBuf> {
        if keep {
            let path = self.dir.keep();
            tracing::info!(path = %path.display(), "Keeping workspace");
            Some(path)
        } else {
            let path = self.dir.path().to_path_buf();
            if let Err(e) = self.dir.close() {
                tracing::warn!(path = %path.display(), "Failed to remove workspace: {}", e);
            }
            None
        }
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(40)
        .collect();
    if cleaned.is_empty() {
        "scenario".to_string()
    } else {
        cleaned
    }
}
