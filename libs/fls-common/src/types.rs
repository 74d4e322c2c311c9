use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Target architecture of a submission.
/// Workers are pinned to one architecture and only ever list that queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    Aarch64,
}

impl Arch {
    /// Returns all architecture variants
    pub fn all_variants() -> &'static [Arch] {
        &[Arch::X86_64, Arch::Aarch64]
    }

    /// Parse an architecture name as reported by `uname -m` or the API.
    /// `arm64` is accepted as an alias for `aarch64`.
    pub fn parse(s: &str) -> Option<Arch> {
        match s.trim().to_lowercase().as_str() {
            "x86_64" | "amd64" => Some(Arch::X86_64),
            "aarch64" | "arm64" => Some(Arch::Aarch64),
            _ => None,
        }
    }

    /// Architecture of the machine this process was compiled for.
    pub fn detect() -> Option<Arch> {
        Self::parse(std::env::consts::ARCH)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One student's build attempt, as listed by the control plane.
///
/// Submissions are write-once: a worker constructs them from the list
/// response and never mutates them afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: u64,
    pub user_id: String,
    /// Server-side name of the uploaded archive. May be null for rows whose
    /// upload never completed; downloading such a submission yields 404.
    pub tarball: Option<String>,
    pub arch: Arch,
    pub created_at: DateTime<Utc>,
}
