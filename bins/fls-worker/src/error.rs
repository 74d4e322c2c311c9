use std::path::PathBuf;

use thiserror::Error;

use crate::extract::ExtractError;

/// Who is to blame for a fault.
///
/// Decided where the fault is first detected and never re-derived later:
/// infrastructure faults cancel the claim so another worker can retry,
/// student faults are reported as a failing result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    Infrastructure,
    Student,
    Unexpected,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Infrastructure => "infrastructure",
            FaultKind::Student => "student",
            FaultKind::Unexpected => "unexpected",
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("authentication failed")]
    Auth,

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("submission already claimed")]
    AlreadyClaimed,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("HTTP {status}: {body}")]
    BadResponse { status: u16, body: String },

    #[error("control plane request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("container engine error ({action}): {source}")]
    Engine {
        action: &'static str,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("{context}: {source}")]
    Environment {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("path {path} is not under mount prefix {prefix}")]
    OutsideMountPrefix { path: PathBuf, prefix: PathBuf },

    #[error("rejected archive: {0}")]
    UnsafeArchive(#[from] ExtractError),

    #[error("builder failed with exit code {0}")]
    BuildFailed(i64),

    #[error("grader failed with exit code {0}")]
    GradeFailed(i64),

    #[error("build artifact exceeded size limit ({limit} bytes)")]
    ArtifactTooLarge { limit: u64 },

    #[error("build produced no bootable image (exit code {0})")]
    ArtifactMissing(i64),

    #[error("container output exceeded the log limit ({limit} bytes)")]
    LogLimitExceeded { limit: u64 },

    #[error("{0}")]
    Unexpected(String),
}

impl WorkerError {
    pub fn kind(&self) -> FaultKind {
        match self {
            WorkerError::Auth
            | WorkerError::NotFound(_)
            | WorkerError::AlreadyClaimed
            | WorkerError::Conflict(_)
            | WorkerError::BadResponse { .. }
            | WorkerError::Transport(_)
            | WorkerError::Engine { .. }
            | WorkerError::Environment { .. }
            | WorkerError::OutsideMountPrefix { .. } => FaultKind::Infrastructure,

            WorkerError::UnsafeArchive(_)
            | WorkerError::BuildFailed(_)
            | WorkerError::GradeFailed(_)
            | WorkerError::ArtifactTooLarge { .. }
            | WorkerError::ArtifactMissing(_)
            | WorkerError::LogLimitExceeded { .. } => FaultKind::Student,

            WorkerError::Unexpected(_) => FaultKind::Unexpected,
        }
    }

    pub fn is_infrastructure(&self) -> bool {
        self.kind() == FaultKind::Infrastructure
    }

    pub fn engine(action: &'static str, source: bollard::errors::Error) -> Self {
        WorkerError::Engine { action, source }
    }

    pub fn environment(context: impl Into<String>, source: std::io::Error) -> Self {
        WorkerError::Environment {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
