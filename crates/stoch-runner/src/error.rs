use std::time::Duration;
use thiserror::Error;

use crate::WorkerId;

/// Failures reported by an engine adapter. All of them are retried inside
/// the worker before anything reaches the scheduler.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("engine open failed: {0}")]
    Open(String),

    #[error("write to region {region} failed: {detail}")]
    Write { region: String, detail: String },

    #[error("recalculate/read of region {region} failed: {detail}")]
    Calc { region: String, detail: String },
}

#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempt(s): {source}")]
pub struct RetryExhausted {
    pub operation: String,
    pub attempts: u32,
    #[source]
    pub source: EngineError,
}

/// Conditions that abort a whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("worker {worker_id} failed: {detail}")]
    WorkerFatal { worker_id: WorkerId, detail: String },

    #[error("worker {worker_id} stuck (no response for {:.0}s)", .elapsed.as_secs_f64())]
    StuckWorker { worker_id: WorkerId, elapsed: Duration },

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("worker pool failed to start: {0}")]
    PoolStart(String),

    #[error("failed to send task to worker {worker_id}: {detail}")]
    Dispatch { worker_id: WorkerId, detail: String },

    #[error("result channel closed with {active_jobs} job(s) in flight")]
    ResultChannelClosed { active_jobs: usize },
}
