use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::types::Arch;

/// Hard cap on captured container output per job (20 MiB)
pub const DEFAULT_MAX_LOG_BYTES: u64 = 20 * 1024 * 1024;
/// Hard cap on the bootable image pulled out of the builder (220 MiB)
pub const DEFAULT_MAX_ARTIFACT_BYTES: u64 = 220 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Control-plane connection settings
#[derive(Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub secret: String,
    pub timeout: Duration,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("secret", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ApiConfig {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            base_url: required(&lookup, "FLS_GRADING_BASEURL")?
                .trim_end_matches('/')
                .to_string(),
            secret: required(&lookup, "FLS_GRADING_SECRET")?,
            timeout: seconds(&lookup, "FLS_HTTP_TIMEOUT_SECS", 30)?,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }
}

/// When to pull sandbox images from the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullPolicy {
    /// Pull before every job so image updates roll out without restarts
    Always,
    /// Pull only when the image is not present locally
    Missing,
}

impl FromStr for PullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "always" => Ok(PullPolicy::Always),
            "missing" | "if-not-present" => Ok(PullPolicy::Missing),
            other => Err(format!("unknown pull policy '{}'", other)),
        }
    }
}

/// Resource caps applied to the builder container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLimits {
    /// Memory limit in bytes; swap is pinned to the same value
    pub memory_bytes: i64,
    pub pids: i64,
    pub cpus: u32,
    pub tmp_size: String,
    pub dist_size: String,
    pub src_size: String,
}

impl BuildLimits {
    pub fn nano_cpus(&self) -> i64 {
        self.cpus as i64 * 1_000_000_000
    }
}

impl Default for BuildLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 8 * 1024 * 1024 * 1024,
            pids: 256,
            cpus: usable_cpus(),
            tmp_size: "4g".to_string(),
            dist_size: "10g".to_string(),
            src_size: "6g".to_string(),
        }
    }
}

/// Host cores minus one, reserving a core for the worker itself.
pub fn usable_cpus() -> u32 {
    let host = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    host.saturating_sub(1).max(1) as u32
}

/// Container sandbox settings
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Real host directory visible to the container engine daemon
    pub host_root: PathBuf,
    /// Where `host_root` is mounted inside this process' filesystem view
    pub mount_prefix: PathBuf,
    pub builder_image: String,
    pub grader_image: String,
    pub limits: BuildLimits,
    pub max_log_bytes: u64,
    pub max_artifact_bytes: u64,
    /// Test-suite profile handed to the grader image as `FLS_SUITE`
    pub grade_suite: Option<String>,
    pub pull_policy: PullPolicy,
}

impl SandboxConfig {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mount_prefix = PathBuf::from(required(&lookup, "FLS_MOUNT_PREFIX")?);
        // Resolve symlinks so workspace paths compare cleanly against the prefix
        let mount_prefix = std::fs::canonicalize(&mount_prefix).unwrap_or(mount_prefix);

        let defaults = BuildLimits::default();
        let memory_bytes = match lookup("FLS_BUILD_MEMORY") {
            Some(raw) => parse_size(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "FLS_BUILD_MEMORY",
                value: raw.clone(),
                reason: "expected a size such as 8g or 512m".to_string(),
            })?,
            None => defaults.memory_bytes,
        };

        let limits = BuildLimits {
            memory_bytes,
            pids: parsed(&lookup, "FLS_BUILD_PIDS", defaults.pids)?,
            cpus: parsed(&lookup, "FLS_BUILD_CPUS", defaults.cpus)?.max(1),
            ..defaults
        };

        let pull_policy = match lookup("FLS_PULL_POLICY") {
            Some(raw) => raw.parse::<PullPolicy>().map_err(|reason| ConfigError::Invalid {
                key: "FLS_PULL_POLICY",
                value: raw.clone(),
                reason,
            })?,
            None => PullPolicy::Always,
        };

        Ok(Self {
            host_root: PathBuf::from(required(&lookup, "FLS_HOST_ROOT")?),
            mount_prefix,
            builder_image: required(&lookup, "FLS_GRADING_BUILDER")?,
            grader_image: required(&lookup, "FLS_GRADING_GRADER")?,
            limits,
            max_log_bytes: parsed(&lookup, "FLS_MAX_LOG_BYTES", DEFAULT_MAX_LOG_BYTES)?,
            max_artifact_bytes: parsed(
                &lookup,
                "FLS_MAX_ARTIFACT_BYTES",
                DEFAULT_MAX_ARTIFACT_BYTES,
            )?,
            grade_suite: lookup("FLS_GRADE_SUITE").filter(|s| !s.trim().is_empty()),
            pull_policy,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parent directory for per-job workspaces
    pub fn jobs_root(&self) -> PathBuf {
        self.mount_prefix.join("jobs")
    }
}

/// Timing knobs for the poll loop and the heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    pub idle_sleep: Duration,
    pub idle_jitter: Duration,
    pub error_sleep: Duration,
    pub max_backoff: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_stop_timeout: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            idle_sleep: Duration::from_secs(15),
            idle_jitter: Duration::from_secs(3),
            error_sleep: Duration::from_secs(60),
            max_backoff: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_stop_timeout: Duration::from_secs(2),
        }
    }
}

impl LoopConfig {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            idle_sleep: seconds(&lookup, "FLS_IDLE_SLEEP_SECS", defaults.idle_sleep.as_secs())?,
            error_sleep: seconds(&lookup, "FLS_ERROR_SLEEP_SECS", defaults.error_sleep.as_secs())?,
            max_backoff: seconds(&lookup, "FLS_MAX_BACKOFF_SECS", defaults.max_backoff.as_secs())?,
            heartbeat_interval: seconds(
                &lookup,
                "FLS_HEARTBEAT_SECS",
                defaults.heartbeat_interval.as_secs(),
            )?,
            ..defaults
        };

        if config.max_backoff < config.error_sleep {
            return Err(ConfigError::Invalid {
                key: "FLS_MAX_BACKOFF_SECS",
                value: config.max_backoff.as_secs().to_string(),
                reason: "must be at least FLS_ERROR_SLEEP_SECS".to_string(),
            });
        }
        if config.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "FLS_HEARTBEAT_SECS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        Ok(config)
    }
}

/// Process log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Worker configuration.
/// Built once at startup and passed by reference to every component.
#[derive(Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    pub sandbox: SandboxConfig,
    pub run: LoopConfig,
    /// Overrides architecture detection when set
    pub arch: Option<Arch>,
    pub metrics_addr: Option<String>,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let arch = match lookup("FLS_ARCH") {
            Some(raw) => Some(Arch::parse(&raw).ok_or_else(|| ConfigError::Invalid {
                key: "FLS_ARCH",
                value: raw.clone(),
                reason: "expected x86_64 or aarch64".to_string(),
            })?),
            None => None,
        };

        let log_format = match lookup("FLS_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            api: ApiConfig::from_lookup(&lookup)?,
            sandbox: SandboxConfig::from_lookup(&lookup)?,
            run: LoopConfig::from_lookup(&lookup)?,
            arch,
            metrics_addr: lookup("FLS_METRICS_ADDR").filter(|s| !s.trim().is_empty()),
            log_format,
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }
}

fn required<F>(lookup: &F, key: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn parsed<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn seconds<F>(lookup: &F, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parsed(lookup, key, default).map(Duration::from_secs)
}

/// Parse a size string (e.g., "8g", "512m", "64k", "1024") to bytes
pub fn parse_size(raw: &str) -> Option<i64> {
    let raw = raw.trim().to_lowercase();
    let (digits, multiplier) = if let Some(n) = raw.strip_suffix('g') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = raw.strip_suffix('m') {
        (n, 1024 * 1024)
    } else if let Some(n) = raw.strip_suffix('k') {
        (n, 1024)
    } else {
        (raw.as_str(), 1)
    };

    digits
        .parse::<i64>()
        .ok()
        .filter(|n| *n > 0)
        .and_then(|n| n.checked_mul(multiplier))
}
