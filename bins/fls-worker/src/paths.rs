//! Path translation between this process and the container engine daemon.
//!
//! The worker usually runs in a container itself, with the shared job
//! storage mounted at `mount_prefix`. Bind-mount sources handed to the
//! daemon must be expressed in the daemon's view (`host_root`).

use std::path::{Component, Path, PathBuf};

use fls_common::SandboxConfig;

use crate::error::{Result, WorkerError};

#[derive(Debug, Clone)]
pub struct PathTranslator {
    mount_prefix: PathBuf,
    host_root: PathBuf,
}

impl PathTranslator {
    pub fn new(mount_prefix: impl Into<PathBuf>, host_root: impl Into<PathBuf>) -> Self {
        Self {
            mount_prefix: normalize(&mount_prefix.into()).unwrap_or_default(),
            host_root: host_root.into(),
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(&config.mount_prefix, &config.host_root)
    }

    /// Translate a path under the mount prefix to the daemon's host path.
    /// Anything outside the prefix is a hard error.
    pub fn to_host(&self, path: &Path) -> Result<PathBuf> {
        let outside = || WorkerError::OutsideMountPrefix {
            path: path.to_path_buf(),
            prefix: self.mount_prefix.clone(),
        };

        if !path.is_absolute() {
            return Err(outside());
        }
        let normalized = normalize(path).ok_or_else(outside)?;
        let relative = normalized
            .strip_prefix(&self.mount_prefix)
            .map_err(|_| outside())?;

        Ok(self.host_root.join(relative))
    }
}

/// Lexically resolve `.` and `..`; `None` if `..` climbs above the root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}
