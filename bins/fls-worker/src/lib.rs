pub mod api;
pub mod error;
pub mod extract;
pub mod health;
pub mod heartbeat;
pub mod joblog;
pub mod metrics;
pub mod paths;
pub mod runner;
pub mod sandbox;
pub mod shutdown;
pub mod trace;
pub mod worker;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use api::{ApiClient, ControlPlane};
pub use error::{FaultKind, WorkerError};
pub use sandbox::{DockerSandbox, Sandbox};
pub use worker::{PassOutcome, Worker, WorkerSettings};
