use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, WorkerError};

const TARBALL_DIR: &str = "tarball";
const SRC_DIR: &str = "src";
const OUT_DIR: &str = "out";
const LOG_FILE: &str = "logs.txt";

/// Scratch directory for a single job, removed when the job ends.
///
/// `remove` is the normal path. If the job unwinds first, `Drop` removes the
/// tree synchronously instead.
#[derive(Debug)]
pub struct JobWorkspace {
    root: PathBuf,
    done: bool,
}

impl JobWorkspace {
    pub async fn create(jobs_root: &Path) -> Result<Self> {
        let root = jobs_root.join(Uuid::new_v4().to_string());
        let workspace = Self { root, done: false };

        for dir in [TARBALL_DIR, SRC_DIR, OUT_DIR] {
            let path = workspace.root.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| WorkerError::environment(format!("failed to create {}", path.display()), e))?;
        }

        debug!(path = %workspace.root.display(), "workspace created");
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tarball_path(&self) -> PathBuf {
        self.root.join(TARBALL_DIR).join("submission.tar")
    }

    pub fn src_dir(&self) -> PathBuf {
        self.root.join(SRC_DIR)
    }

    pub fn out_dir(&self) -> PathBuf {
        self.root.join(OUT_DIR)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(LOG_FILE)
    }

    /// Delete the workspace. Failures are logged, never returned.
    pub async fn remove(mut self) {
        self.done = true;
        if let Err(e) = tokio::fs::remove_dir_all(&self.root).await {
            warn!(path = %self.root.display(), error = %e, "failed to remove workspace");
        }
    }

    /// Keep the workspace on disk and hand back its path.
    pub fn into_kept(mut self) -> PathBuf {
        self.done = true;
        std::mem::take(&mut self.root)
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.root.display(), error = %e, "failed to remove workspace");
            }
        }
    }
}
