//! Worker side of the coordination protocol.
//!
//! A worker owns exactly one engine instance opened on its private model
//! copy, blocks on its task channel with no timeout and answers every task
//! on the result channel. The first unrecoverable failure is reported once
//! as [`ResultMessage::Error`] and the worker stops taking tasks.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, WorkerSettings};
use crate::engine::{CommandEngineOpener, Engine, EngineOpener, EngineSession};
use crate::output::{policy_output_path, write_policy_csv, SimOutput};
use crate::protocol::{LineResultSink, LineTaskSource, ResultMessage, ResultSink, TaskMessage, TaskSource};
use crate::{PolicyId, ScenarioId, WorkerId};

/// Attempts at opening the engine before initialization is declared fatal.
pub const OPEN_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    Idle,
    ScenarioBound(ScenarioId),
    Computing {
        scenario_id: ScenarioId,
        policy_id: PolicyId,
    },
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// `Shutdown` received.
    Shutdown,
    /// The scheduler side of the task channel went away.
    ChannelClosed,
    Failed(String),
}

impl WorkerExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerExit::Shutdown | WorkerExit::ChannelClosed => 0,
            WorkerExit::Failed(_) => 1,
        }
    }
}

pub struct Worker<'a> {
    id: WorkerId,
    settings: &'a WorkerSettings,
    state: WorkerState,
    open_retry_step: Duration,
}

impl<'a> Worker<'a> {
    pub fn new(id: WorkerId, settings: &'a WorkerSettings) -> Self {
        Self {
            id,
            settings,
            state: WorkerState::Initializing,
            open_retry_step: Duration::from_secs(1),
        }
    }

    /// Linear step between open attempts (`step * attempt`).
    pub fn with_open_retry_step(mut self, step: Duration) -> Self {
        self.open_retry_step = step;
        self
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Runs until `Shutdown`, a closed task channel, or the first fatal
    /// failure. The engine is released before this returns on every path.
    pub fn run<O, S, K>(
        &mut self,
        opener: &O,
        model_path: &Path,
        tasks: &mut S,
        results: &mut K,
    ) -> WorkerExit
    where
        O: EngineOpener,
        S: TaskSource,
        K: ResultSink,
    {
        let started = Instant::now();
        info!(worker = self.id, model = %model_path.display(), "worker initializing");
        let outcome = self.open_engine(opener, model_path).and_then(|session| {
            info!(
                worker = self.id,
                init_s = started.elapsed().as_secs_f64(),
                "worker ready to process jobs"
            );
            self.serve(session, tasks, results)
        });
        let exit = match outcome {
            Ok(exit) => exit,
            Err(err) => {
                let detail = format!("{:#}", err);
                error!(worker = self.id, error = %detail, "worker encountered fatal error");
                let report = ResultMessage::Error {
                    worker_id: self.id,
                    error: detail.clone(),
                };
                if let Err(send_err) = results.send(report) {
                    error!(worker = self.id, error = %send_err, "could not report worker error");
                }
                WorkerExit::Failed(detail)
            }
        };
        self.transition(WorkerState::Terminated);
        info!(worker = self.id, "worker shut down");
        exit
    }

    fn transition(&mut self, next: WorkerState) {
        debug!(worker = self.id, from = ?self.state, to = ?next, "worker state");
        self.state = next;
    }

    fn open_engine<O: EngineOpener>(
        &mut self,
        opener: &O,
        model_path: &Path,
    ) -> Result<EngineSession<O::Engine>> {
        let mut attempt = 1;
        loop {
            match opener.open(model_path) {
                Ok(engine) => return Ok(EngineSession::new(engine)),
                Err(err) if attempt < OPEN_ATTEMPTS => {
                    warn!(worker = self.id, attempt, error = %err, "failed to open model");
                    thread::sleep(self.open_retry_step * attempt);
                    attempt += 1;
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err).context(format!(
                        "could not open {} after {} attempts",
                        model_path.display(),
                        attempt
                    )))
                }
            }
        }
    }

    fn serve<E, S, K>(
        &mut self,
        mut engine: EngineSession<E>,
        tasks: &mut S,
        results: &mut K,
    ) -> Result<WorkerExit>
    where
        E: Engine,
        S: TaskSource,
        K: ResultSink,
    {
        self.transition(WorkerState::Idle);
        loop {
            let Some(task) = tasks.recv()? else {
                warn!(worker = self.id, "task channel closed, shutting down");
                self.transition(WorkerState::ShuttingDown);
                return Ok(WorkerExit::ChannelClosed);
            };
            match task {
                TaskMessage::Shutdown => {
                    debug!(worker = self.id, "received shutdown signal");
                    self.transition(WorkerState::ShuttingDown);
                    return Ok(WorkerExit::Shutdown);
                }
                TaskMessage::SetScenario {
                    scenario_id,
                    assumptions,
                } => {
                    self.set_scenario(&mut engine, scenario_id, &assumptions)?;
                    results.send(ResultMessage::ScenarioSet {
                        worker_id: self.id,
                        scenario_id,
                    })?;
                }
                TaskMessage::RunPolicy {
                    scenario_id,
                    policy_id,
                    policy,
                } => {
                    self.run_policy(&mut engine, scenario_id, policy_id, &policy)?;
                    results.send(ResultMessage::PolicyDone {
                        worker_id: self.id,
                        scenario_id,
                        policy_id,
                    })?;
                }
            }
        }
    }

    fn set_scenario<E: Engine>(
        &mut self,
        engine: &mut EngineSession<E>,
        scenario_id: ScenarioId,
        assumptions: &[f64],
    ) -> Result<()> {
        let region = &self.settings.regions.assumptions;
        self.settings
            .retry
            .run(&format!("set scenario {}", scenario_id), |_| {
                engine.write_region(region, assumptions)
            })?;
        self.transition(WorkerState::ScenarioBound(scenario_id));
        debug!(worker = self.id, scenario = scenario_id, "scenario set");
        Ok(())
    }

    fn run_policy<E: Engine>(
        &mut self,
        engine: &mut EngineSession<E>,
        scenario_id: ScenarioId,
        policy_id: PolicyId,
        policy: &[f64],
    ) -> Result<()> {
        match self.state {
            WorkerState::ScenarioBound(bound) if bound == scenario_id => {}
            other => {
                return Err(anyhow!(
                    "policy {} for scenario {} received while worker is {:?}",
                    policy_id,
                    scenario_id,
                    other
                ))
            }
        }
        self.transition(WorkerState::Computing {
            scenario_id,
            policy_id,
        });
        let job_start = Instant::now();
        let settings = self.settings;

        settings
            .retry
            .run(&format!("set policy {}", policy_id), |_| {
                engine.write_region(&settings.regions.policy, policy)
            })?;
        debug!(worker = self.id, policy = policy_id, "policy set");

        let calc_start = Instant::now();
        let mut outputs = Vec::with_capacity(settings.n_sims);
        for sim in 0..settings.n_sims {
            let values = settings
                .retry
                .run(&format!("simulation {}", sim), |_| {
                    engine.recalculate_and_read(&settings.regions.output)
                })
                .with_context(|| format!("policy {} aborted", policy_id))?;
            outputs.push(SimOutput::from_values(&values));
        }
        let calc_s = calc_start.elapsed().as_secs_f64();

        let write_start = Instant::now();
        let path = policy_output_path(&settings.output_dir, scenario_id, policy_id);
        write_policy_csv(&path, &outputs)?;
        debug!(
            worker = self.id,
            scenario = scenario_id,
            policy = policy_id,
            calc_s,
            write_s = write_start.elapsed().as_secs_f64(),
            total_s = job_start.elapsed().as_secs_f64(),
            "policy results saved"
        );
        self.transition(WorkerState::ScenarioBound(scenario_id));
        Ok(())
    }
}

/// Entry point of a worker process: tasks arrive on stdin, results leave on
/// stdout, logs go to stderr.
pub fn serve_process(config: &EngineConfig, worker_id: WorkerId, model_path: &Path) -> WorkerExit {
    let settings = config.worker_settings();
    let opener = CommandEngineOpener::new(config.engine_command.clone());
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut tasks = LineTaskSource::new(stdin.lock());
    let mut results = LineResultSink::new(stdout.lock());
    Worker::new(worker_id, &settings).run(&opener, model_path, &mut tasks, &mut results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineRegions, Region};
    use crate::error::EngineError;
    use crate::retry::RetryPolicy;
    use crate::testing::{temp_root, FakeEngineOpener};
    use std::sync::mpsc;

    fn settings(root: &Path, n_sims: usize) -> WorkerSettings {
        WorkerSettings {
            n_sims,
            regions: EngineRegions {
                assumptions: Region::new("Inputs", "I7:Z7"),
                policy: Region::new("Inputs", "I3:T3"),
                output: Region::new("Inputs", "U11:V11"),
            },
            retry: RetryPolicy {
                max_retries: 3,
                retry_delay: Duration::from_millis(1),
                retry_backoff: 2.0,
            },
            output_dir: root.to_path_buf(),
        }
    }

    fn run_with(
        settings: &WorkerSettings,
        opener: &FakeEngineOpener,
        tasks: Vec<TaskMessage>,
    ) -> (WorkerExit, Vec<ResultMessage>) {
        let (task_tx, mut task_rx) = mpsc::channel();
        for t in tasks {
            task_tx.send(t).expect("queue task");
        }
        drop(task_tx);
        let (mut result_tx, result_rx) = mpsc::channel();
        let exit = Worker::new(7, settings)
            .with_open_retry_step(Duration::from_millis(1))
            .run(opener, Path::new("model_worker_7.xlsb"), &mut task_rx, &mut result_tx);
        drop(result_tx);
        (exit, result_rx.iter().collect())
    }

    fn set(scenario_id: u32) -> TaskMessage {
        TaskMessage::SetScenario {
            scenario_id,
            assumptions: vec![0.01, 0.02],
        }
    }

    fn run(scenario_id: u32, policy_id: u32) -> TaskMessage {
        TaskMessage::RunPolicy {
            scenario_id,
            policy_id,
            policy: vec![policy_id as f64],
        }
    }

    #[test]
    fn processes_tasks_in_order_and_writes_results() {
        let root = temp_root("worker_ok");
        let settings = settings(&root, 4);
        let opener = FakeEngineOpener::default();
        let (exit, results) = run_with(
            &settings,
            &opener,
            vec![set(1), run(1, 10), run(1, 20), TaskMessage::Shutdown, run(1, 30)],
        );
        assert_eq!(exit, WorkerExit::Shutdown);
        assert_eq!(
            results,
            vec![
                ResultMessage::ScenarioSet {
                    worker_id: 7,
                    scenario_id: 1
                },
                ResultMessage::PolicyDone {
                    worker_id: 7,
                    scenario_id: 1,
                    policy_id: 10
                },
                ResultMessage::PolicyDone {
                    worker_id: 7,
                    scenario_id: 1,
                    policy_id: 20
                },
            ]
        );
        let csv = std::fs::read_to_string(policy_output_path(&root, 1, 20)).expect("csv");
        assert_eq!(csv.lines().count(), 5);
        assert!(csv.starts_with("sim,PVFP,PVFPrem\n1,"));
        assert!(!policy_output_path(&root, 1, 30).exists());

        let log = opener.log();
        assert_eq!(log.opens, 1);
        assert_eq!(log.closes, 1);
        assert_eq!(log.calcs, 8);
        assert_eq!(log.writes[0].0, "Inputs!I7:Z7");
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn exhausted_simulation_fails_whole_policy_and_stops_worker() {
        let root = temp_root("worker_calc_fail");
        let settings = settings(&root, 5);
        // calc call #2 (0-based) and every later one fails
        let opener = FakeEngineOpener::with_calc(|call| {
            if call >= 2 {
                Err(EngineError::Calc {
                    region: "Inputs!U11:V11".to_string(),
                    detail: "#REF!".to_string(),
                })
            } else {
                Ok(vec![1.0, 2.0])
            }
        });
        let (exit, results) =
            run_with(&settings, &opener, vec![set(2), run(2, 10), run(2, 11)]);
        let detail = match exit {
            WorkerExit::Failed(detail) => detail,
            other => panic!("expected failure, got {:?}", other),
        };
        assert!(detail.contains("simulation 2 failed after 3 attempt(s)"), "{}", detail);
        assert_eq!(results.len(), 2);
        assert!(matches!(results[1], ResultMessage::Error { worker_id: 7, .. }));
        assert!(!policy_output_path(&root, 2, 10).exists());
        let log = opener.log();
        assert_eq!(log.calcs, 2 + 3);
        assert_eq!(log.closes, 1);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn transient_write_failure_is_retried() {
        let root = temp_root("worker_transient");
        let settings = settings(&root, 1);
        let opener = FakeEngineOpener::with_write(|call| {
            if call == 0 {
                Err(EngineError::Write {
                    region: "Inputs!I7:Z7".to_string(),
                    detail: "busy".to_string(),
                })
            } else {
                Ok(())
            }
        });
        let (exit, results) = run_with(&settings, &opener, vec![set(3), run(3, 1)]);
        assert_eq!(exit, WorkerExit::ChannelClosed);
        assert_eq!(results.len(), 2);
        assert_eq!(opener.log().writes.len(), 3);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn policy_for_unbound_scenario_is_fatal() {
        let root = temp_root("worker_unbound");
        let settings = settings(&root, 1);
        let opener = FakeEngineOpener::default();
        let (exit, results) = run_with(&settings, &opener, vec![set(1), run(2, 10)]);
        assert!(matches!(exit, WorkerExit::Failed(_)));
        match &results[1] {
            ResultMessage::Error { error, .. } => {
                assert!(error.contains("scenario 2"), "{}", error)
            }
            other => panic!("expected error, got {:?}", other),
        }
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn open_failure_is_reported_once_after_three_attempts() {
        let root = temp_root("worker_open");
        let settings = settings(&root, 1);
        let opener = FakeEngineOpener::failing_open();
        let (exit, results) = run_with(&settings, &opener, vec![set(1)]);
        assert!(matches!(exit, WorkerExit::Failed(_)));
        assert_eq!(exit.exit_code(), 1);
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], ResultMessage::Error { .. }));
        let log = opener.log();
        assert_eq!(log.opens, OPEN_ATTEMPTS as usize);
        assert_eq!(log.closes, 0);
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn state_ends_terminated() {
        let root = temp_root("worker_state");
        let settings = settings(&root, 1);
        let opener = FakeEngineOpener::default();
        let (task_tx, mut task_rx) = mpsc::channel();
        task_tx.send(TaskMessage::Shutdown).expect("send");
        let (mut result_tx, _result_rx) = mpsc::channel();
        let mut worker = Worker::new(1, &settings);
        assert_eq!(worker.state(), WorkerState::Initializing);
        let exit = worker.run(&opener, Path::new("m.xlsb"), &mut task_rx, &mut result_tx);
        assert_eq!(exit, WorkerExit::Shutdown);
        assert_eq!(worker.state(), WorkerState::Terminated);
        let _ = std::fs::remove_dir_all(root);
    }
}
