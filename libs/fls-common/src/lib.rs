pub mod config;
pub mod routes;
pub mod types;

// Re-export commonly used types for convenience
pub use config::{ApiConfig, Config, ConfigError, LoopConfig, SandboxConfig};
pub use types::{Arch, Submission};
