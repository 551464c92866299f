//! Scheduler loop: hands jobs to idle workers, collects their results,
//! watches for stuck workers and shuts the pool down on every exit path.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::RunError;
use crate::jobs::{Job, JobBacklog};
use crate::pool::{join_or_kill, WorkerLink};
use crate::protocol::{ResultMessage, TaskMessage};
use crate::tables::InputTable;
use crate::{PolicyId, ScenarioId, WorkerId};

/// Fraction of `worker_timeout` after which a silent busy worker is
/// reported before it is declared stuck.
const STUCK_WARN_RATIO: f64 = 0.7;

/// Cooperative stop request shared with a signal listener.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct WorkerRecord {
    pub id: WorkerId,
    pub link: Box<dyn WorkerLink>,
    /// Set from `RunPolicy` until the matching `PolicyDone`/`Error`.
    pub busy: bool,
    /// Scenario last loaded into this worker's engine.
    pub scenario_affinity: Option<ScenarioId>,
    pub last_activity: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Running,
    Dispatching,
    Collecting,
    ShuttingDown,
    Terminated,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Interrupted,
    Failed(RunError),
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Interrupted => "interrupted",
            RunOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub elapsed: Duration,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn average_per_job(&self) -> Option<Duration> {
        (self.completed_jobs > 0).then(|| self.elapsed / self.completed_jobs as u32)
    }

    pub fn into_result(self) -> Result<RunReport> {
        match self.outcome {
            RunOutcome::Completed => Ok(self),
            RunOutcome::Interrupted => Err(anyhow!(
                "run interrupted after {}/{} jobs",
                self.completed_jobs,
                self.total_jobs
            )),
            RunOutcome::Failed(err) => Err(err.into()),
        }
    }

    fn log(&self) {
        let avg = self.average_per_job().map(|d| d.as_secs_f64()).unwrap_or(0.0);
        info!(
            outcome = self.outcome.label(),
            completed = self.completed_jobs,
            total = self.total_jobs,
            elapsed_s = self.elapsed.as_secs_f64(),
            avg_s = avg,
            "Completed {}/{} jobs in {:.2}s ({:.2}s per job)",
            self.completed_jobs,
            self.total_jobs,
            self.elapsed.as_secs_f64(),
            avg
        );
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    assumptions: InputTable,
    policies: InputTable,
    backlog: JobBacklog,
    workers: Vec<WorkerRecord>,
    results: Receiver<ResultMessage>,
    shutdown: ShutdownHandle,
    phase: SchedulerPhase,
    active_jobs: usize,
    completed_jobs: usize,
    job_started: HashMap<Job, Instant>,
}

impl Scheduler {
    /// Every selected scenario and policy must have a row in its table.
    pub fn new(
        config: SchedulerConfig,
        assumptions: InputTable,
        policies: InputTable,
        scenario_ids: &[ScenarioId],
        policy_ids: &[PolicyId],
        workers: Vec<(WorkerId, Box<dyn WorkerLink>)>,
        results: Receiver<ResultMessage>,
    ) -> Result<Self> {
        let missing_scenarios = assumptions.missing(scenario_ids);
        if !missing_scenarios.is_empty() {
            return Err(anyhow!("no assumptions for scenario(s) {:?}", missing_scenarios));
        }
        let missing_policies = policies.missing(policy_ids);
        if !missing_policies.is_empty() {
            return Err(anyhow!("no policy data for policy id(s) {:?}", missing_policies));
        }
        if workers.is_empty() {
            return Err(anyhow!("scheduler needs at least one worker"));
        }
        let now = Instant::now();
        let mut workers: Vec<WorkerRecord> = workers
            .into_iter()
            .map(|(id, link)| WorkerRecord {
                id,
                link,
                busy: false,
                scenario_affinity: None,
                last_activity: now,
            })
            .collect();
        workers.sort_by_key(|w| w.id);
        Ok(Self {
            config,
            assumptions,
            policies,
            backlog: JobBacklog::build(scenario_ids, policy_ids),
            workers,
            results,
            shutdown: ShutdownHandle::new(),
            phase: SchedulerPhase::Running,
            active_jobs: 0,
            completed_jobs: 0,
            job_started: HashMap::new(),
        })
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn workers(&self) -> &[WorkerRecord] {
        &self.workers
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub fn total_jobs(&self) -> usize {
        self.backlog.total()
    }

    /// Runs the backlog to completion, interrupt or first fatal error, then
    /// stops every worker.
    pub fn run(&mut self) -> RunReport {
        let started = Instant::now();
        info!(
            workers = self.workers.len(),
            jobs = self.backlog.total(),
            "starting scheduler"
        );
        let outcome = match self.drive() {
            Ok(()) if self.completed_jobs < self.backlog.total() => {
                warn!("shutdown requested, stopping dispatch");
                RunOutcome::Interrupted
            }
            Ok(()) => RunOutcome::Completed,
            Err(err) => {
                error!(error = %err, "run aborted");
                RunOutcome::Failed(err)
            }
        };
        self.shutdown_workers();
        let report = RunReport {
            total_jobs: self.backlog.total(),
            completed_jobs: self.completed_jobs,
            elapsed: started.elapsed(),
            outcome,
        };
        report.log();
        report
    }

    fn set_phase(&mut self, next: SchedulerPhase) {
        if self.phase != next {
            debug!(from = ?self.phase, to = ?next, "scheduler phase");
            self.phase = next;
        }
    }

    fn drive(&mut self) -> Result<(), RunError> {
        while (!self.backlog.is_empty() || self.active_jobs > 0) && !self.shutdown.is_requested() {
            self.set_phase(SchedulerPhase::Dispatching);
            self.dispatch()?;
            self.set_phase(SchedulerPhase::Collecting);
            self.collect()?;
            self.set_phase(SchedulerPhase::Running);
        }
        Ok(())
    }

    fn dispatch(&mut self) -> Result<(), RunError> {
        for idx in 0..self.workers.len() {
            if self.workers[idx].busy || self.shutdown.is_requested() {
                continue;
            }
            let Some(job) = self.backlog.pop_next() else {
                break;
            };
            self.assign(idx, job)?;
        }
        Ok(())
    }

    fn assign(&mut self, idx: usize, job: Job) -> Result<(), RunError> {
        let record = &mut self.workers[idx];
        let worker_id = record.id;
        let dispatch_err = |detail: String| RunError::Dispatch { worker_id, detail };

        if record.scenario_affinity != Some(job.scenario_id) {
            let assumptions = self
                .assumptions
                .get(job.scenario_id)
                .ok_or_else(|| dispatch_err(format!("no assumptions for scenario {}", job.scenario_id)))?;
            record
                .link
                .send(&TaskMessage::SetScenario {
                    scenario_id: job.scenario_id,
                    assumptions: assumptions.to_vec(),
                })
                .map_err(|e| dispatch_err(format!("{:#}", e)))?;
            record.scenario_affinity = Some(job.scenario_id);
            debug!(worker = worker_id, scenario = job.scenario_id, "sent scenario");
        }

        let policy = self
            .policies
            .get(job.policy_id)
            .ok_or_else(|| dispatch_err(format!("no policy data for policy {}", job.policy_id)))?;
        record
            .link
            .send(&TaskMessage::RunPolicy {
                scenario_id: job.scenario_id,
                policy_id: job.policy_id,
                policy: policy.to_vec(),
            })
            .map_err(|e| dispatch_err(format!("{:#}", e)))?;
        let now = Instant::now();
        record.busy = true;
        record.last_activity = now;
        self.active_jobs += 1;
        self.job_started.insert(job, now);
        debug!(worker = worker_id, job = %job, "dispatched job");
        Ok(())
    }

    fn collect(&mut self) -> Result<(), RunError> {
        match self.results.recv_timeout(self.config.queue_timeout) {
            Ok(message) => self.handle_result(message),
            Err(RecvTimeoutError::Timeout) => self.check_stuck().map(|_| ()),
            Err(RecvTimeoutError::Disconnected) => Err(RunError::ResultChannelClosed {
                active_jobs: self.active_jobs,
            }),
        }
    }

    fn handle_result(&mut self, message: ResultMessage) -> Result<(), RunError> {
        let now = Instant::now();
        match message {
            ResultMessage::ScenarioSet {
                worker_id,
                scenario_id,
            } => {
                debug!(worker = worker_id, scenario = scenario_id, "scenario set");
                Ok(())
            }
            ResultMessage::PolicyDone {
                worker_id,
                scenario_id,
                policy_id,
            } => {
                let Some(record) = self.record_mut(worker_id) else {
                    warn!(worker = worker_id, "completion from unknown worker");
                    return Ok(());
                };
                if !record.busy {
                    warn!(worker = worker_id, "completion from idle worker ignored");
                    return Ok(());
                }
                record.busy = false;
                record.last_activity = now;
                self.active_jobs = self.active_jobs.saturating_sub(1);
                self.completed_jobs += 1;
                let job = Job {
                    scenario_id,
                    policy_id,
                };
                let job_s = self
                    .job_started
                    .remove(&job)
                    .map(|t| now.duration_since(t).as_secs_f64())
                    .unwrap_or(0.0);
                info!(
                    worker = worker_id,
                    scenario = scenario_id,
                    policy = policy_id,
                    elapsed_s = job_s,
                    "Completed {}/{} {} ({:.2}s)",
                    self.completed_jobs,
                    self.backlog.total(),
                    job,
                    job_s
                );
                Ok(())
            }
            ResultMessage::Error { worker_id, error } => {
                error!(worker = worker_id, error = %error, "worker reported fatal error");
                Err(RunError::WorkerFatal {
                    worker_id,
                    detail: error,
                })
            }
        }
    }

    /// Ids of busy workers past the warning threshold, or the first one
    /// past `worker_timeout` as an error.
    fn check_stuck(&mut self) -> Result<Vec<WorkerId>, RunError> {
        let now = Instant::now();
        let timeout = self.config.worker_timeout;
        let warn_after = timeout.mul_f64(STUCK_WARN_RATIO);
        let mut warned = Vec::new();
        for record in self.workers.iter_mut().filter(|w| w.busy) {
            let elapsed = now.duration_since(record.last_activity);
            if elapsed > timeout {
                error!(
                    worker = record.id,
                    elapsed_s = elapsed.as_secs_f64(),
                    "worker stuck, terminating"
                );
                record.link.terminate();
                return Err(RunError::StuckWorker {
                    worker_id: record.id,
                    elapsed,
                });
            }
            if elapsed > warn_after {
                warn!(
                    worker = record.id,
                    elapsed_s = elapsed.as_secs_f64(),
                    timeout_s = timeout.as_secs_f64(),
                    "worker has not responded"
                );
                warned.push(record.id);
            }
        }
        Ok(warned)
    }

    fn record_mut(&mut self, worker_id: WorkerId) -> Option<&mut WorkerRecord> {
        self.workers.iter_mut().find(|w| w.id == worker_id)
    }

    fn shutdown_workers(&mut self) {
        self.set_phase(SchedulerPhase::ShuttingDown);
        info!(workers = self.workers.len(), "shutting down workers");
        for record in &mut self.workers {
            if let Err(err) = record.link.send(&TaskMessage::Shutdown) {
                warn!(worker = record.id, error = %err, "failed to send shutdown");
            }
        }
        for record in &mut self.workers {
            join_or_kill(
                record.id,
                record.link.as_mut(),
                self.config.join_timeout,
                self.config.kill_grace,
            );
            record.busy = false;
        }
        self.set_phase(SchedulerPhase::Terminated);
        info!("all workers stopped");
    }
}
