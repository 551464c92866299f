//! Distributes (scenario × policy) simulation jobs over a pool of worker
//! processes, each of which owns one non-thread-safe engine instance.

pub mod aggregate;
pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod output;
pub mod pool;
pub mod protocol;
pub mod provision;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod selection;
pub mod tables;
pub mod worker;

#[cfg(test)]
mod testing;

pub type ScenarioId = u32;
pub type PolicyId = u32;
/// 1-based.
pub type WorkerId = u32;

pub use aggregate::{aggregate_results, AggregateReport};
pub use config::{EngineConfig, SchedulerConfig, WorkerSettings};
pub use error::{EngineError, RetryExhausted, RunError};
pub use pool::{ProcessLauncher, WorkerLauncher, WorkerLink};
pub use provision::{provision_worker_models, ProvisionOptions, ProvisionedModel};
pub use runner::{describe, run_from_config, RunPlan};
pub use scheduler::{RunOutcome, RunReport, Scheduler, ShutdownHandle};
pub use worker::{serve_process, WorkerExit};
